use salvo::prelude::*;
use serde_json::json;
use tracing::warn;

use crate::db::DatabaseManager;

#[derive(Clone, Default)]
pub struct HealthHandler;

#[handler]
impl HealthHandler {
    async fn handle(&self, res: &mut Response) {
        res.render(Json(json!({ "status": "ok" })));
    }
}

/// Ready once the database answers a ping.
#[derive(Clone)]
pub struct ReadyHandler {
    db: DatabaseManager,
}

impl ReadyHandler {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }
}

#[handler]
impl ReadyHandler {
    async fn handle(&self, res: &mut Response) {
        match self.db.ping().await {
            Ok(()) => res.render(Json(json!({ "status": "ready" }))),
            Err(err) => {
                warn!("readiness check failed: {err}");
                res.status_code(StatusCode::SERVICE_UNAVAILABLE);
                res.render(Json(json!({ "status": "unavailable", "error": err.to_string() })));
            }
        }
    }
}
