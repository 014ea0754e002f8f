use async_trait::async_trait;

use super::DatabaseError;
use super::models::{GroupMember, MessageMapping, RoomMapping, ViberUser};

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts the user or refreshes the display name of an existing one.
    async fn upsert_viber_user(&self, viber_id: &str, viber_name: &str)
    -> Result<(), DatabaseError>;
    async fn get_viber_user(&self, viber_id: &str) -> Result<Option<ViberUser>, DatabaseError>;
    async fn get_viber_user_by_matrix_id(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<ViberUser>, DatabaseError>;
    /// Fails with `NotFound` when the Viber user has never been seen.
    async fn link_viber_user(
        &self,
        viber_id: &str,
        matrix_user_id: &str,
    ) -> Result<(), DatabaseError>;
    /// Clears the link held by `matrix_user_id`, if any.
    async fn unlink_matrix_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError>;
    async fn list_linked_users(&self) -> Result<Vec<ViberUser>, DatabaseError>;
}

#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_matrix_room_id(&self, viber_chat_id: &str)
    -> Result<Option<String>, DatabaseError>;
    async fn get_viber_chat_id(&self, matrix_room_id: &str)
    -> Result<Option<String>, DatabaseError>;
    /// Fails with `Conflict` when either side is already mapped.
    async fn create_room_mapping(
        &self,
        viber_chat_id: &str,
        matrix_room_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn list_room_mappings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMapping>, DatabaseError>;
    async fn count_rooms(&self) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Last write wins for a given `viber_message_id`.
    async fn store_message_mapping(
        &self,
        viber_message_id: &str,
        matrix_event_id: &str,
        viber_chat_id: &str,
    ) -> Result<(), DatabaseError>;
    async fn get_matrix_event_id(
        &self,
        viber_message_id: &str,
    ) -> Result<Option<String>, DatabaseError>;
    async fn get_by_matrix_event_id(
        &self,
        matrix_event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError>;
}

#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn upsert_group_member(
        &self,
        viber_chat_id: &str,
        viber_user_id: &str,
        viber_user_name: &str,
    ) -> Result<(), DatabaseError>;
    async fn list_group_members(&self, viber_chat_id: &str)
    -> Result<Vec<GroupMember>, DatabaseError>;
}
