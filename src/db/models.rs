use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViberUser {
    pub viber_id: String,
    pub viber_name: String,
    pub matrix_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMapping {
    pub id: i64,
    pub viber_chat_id: String,
    pub matrix_room_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMapping {
    pub id: i64,
    pub viber_message_id: String,
    pub matrix_event_id: String,
    pub viber_chat_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub viber_chat_id: String,
    pub viber_user_id: String,
    pub viber_user_name: String,
    pub joined_at: DateTime<Utc>,
}
