use salvo::prelude::*;
use serde_json::json;

use crate::db::DatabaseManager;

fn render_error(res: &mut Response, status: StatusCode, message: &str) {
    res.status_code(status);
    res.render(Json(json!({ "error": message })));
}

/// `GET /_bridge/rooms?limit&offset`
#[derive(Clone)]
pub struct ListRoomsHandler {
    db: DatabaseManager,
}

impl ListRoomsHandler {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[handler]
impl ListRoomsHandler {
    async fn handle(&self, req: &mut Request, res: &mut Response) {
        let limit = req.query::<i64>("limit").unwrap_or(100).clamp(1, 1000);
        let offset = req.query::<i64>("offset").unwrap_or(0).max(0);

        match self.db.room_store().list_room_mappings(limit, offset).await {
            Ok(rooms) => {
                res.render(Json(json!({
                    "rooms": rooms,
                    "count": rooms.len(),
                    "limit": limit,
                    "offset": offset,
                })));
            }
            Err(err) => {
                render_error(
                    res,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("database error: {}", err),
                );
            }
        }
    }
}

/// `GET /_bridge/chats/{chat_id}/members`
#[derive(Clone)]
pub struct ListMembersHandler {
    db: DatabaseManager,
}

impl ListMembersHandler {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[handler]
impl ListMembersHandler {
    async fn handle(&self, req: &mut Request, res: &mut Response) {
        let Some(chat_id) = req.param::<String>("chat_id").filter(|id| !id.is_empty()) else {
            render_error(res, StatusCode::BAD_REQUEST, "missing chat id");
            return;
        };

        match self.db.member_store().list_group_members(&chat_id).await {
            Ok(members) => {
                res.render(Json(json!({
                    "viber_chat_id": chat_id,
                    "members": members,
                    "count": members.len(),
                })));
            }
            Err(err) => {
                render_error(
                    res,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("database error: {}", err),
                );
            }
        }
    }
}
