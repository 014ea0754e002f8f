use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::Text;
use diesel::sqlite::SqliteConnection;
use tracing::debug;

use crate::db::schema_sqlite::{group_members, message_mappings, room_mappings, viber_users};

use super::{
    DatabaseError, MappingCache,
    error::require,
    models::{GroupMember, MessageMapping, RoomMapping, ViberUser},
};

pub type SqlitePool = Pool<ConnectionManager<SqliteConnection>>;

fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

fn now_string() -> String {
    datetime_to_string(&Utc::now())
}

/// Pool plus the deadline applied to every store operation. Work runs on the
/// blocking pool; a deadline miss returns `Timeout` but lets the statement
/// finish so no write is torn.
#[derive(Clone)]
pub struct SqliteHandle {
    pool: SqlitePool,
    op_timeout: Duration,
}

impl SqliteHandle {
    pub fn new(pool: SqlitePool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    pub async fn run<T, F>(&self, op: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Timeout(format!("connection pool exhausted: {e}")))?;
            op(&mut *conn)
        });

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(joined) => {
                joined.map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
            }
            Err(_) => Err(DatabaseError::Timeout(format!(
                "operation exceeded {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = viber_users)]
struct DbViberUser {
    viber_id: String,
    viber_name: String,
    matrix_user_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbViberUser {
    fn to_viber_user(&self) -> Result<ViberUser, DatabaseError> {
        Ok(ViberUser {
            viber_id: self.viber_id.clone(),
            viber_name: self.viber_name.clone(),
            matrix_user_id: self.matrix_user_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = room_mappings)]
struct DbRoomMapping {
    id: i32,
    viber_chat_id: String,
    matrix_room_id: String,
    created_at: String,
}

impl DbRoomMapping {
    fn to_room_mapping(&self) -> Result<RoomMapping, DatabaseError> {
        Ok(RoomMapping {
            id: self.id as i64,
            viber_chat_id: self.viber_chat_id.clone(),
            matrix_room_id: self.matrix_room_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = room_mappings)]
struct NewRoomMapping<'a> {
    viber_chat_id: &'a str,
    matrix_room_id: &'a str,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_mappings)]
struct DbMessageMapping {
    id: i32,
    viber_message_id: String,
    matrix_event_id: String,
    viber_chat_id: String,
    created_at: String,
    updated_at: String,
}

impl DbMessageMapping {
    fn to_message_mapping(&self) -> Result<MessageMapping, DatabaseError> {
        Ok(MessageMapping {
            id: self.id as i64,
            viber_message_id: self.viber_message_id.clone(),
            matrix_event_id: self.matrix_event_id.clone(),
            viber_chat_id: self.viber_chat_id.clone(),
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = group_members)]
struct DbGroupMember {
    viber_chat_id: String,
    viber_user_id: String,
    viber_user_name: String,
    joined_at: String,
}

impl DbGroupMember {
    fn to_group_member(&self) -> Result<GroupMember, DatabaseError> {
        Ok(GroupMember {
            viber_chat_id: self.viber_chat_id.clone(),
            viber_user_id: self.viber_user_id.clone(),
            viber_user_name: self.viber_user_name.clone(),
            joined_at: string_to_datetime(&self.joined_at)?,
        })
    }
}

pub struct SqliteUserStore {
    db: SqliteHandle,
}

impl SqliteUserStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl super::UserStore for SqliteUserStore {
    async fn upsert_viber_user(
        &self,
        viber_id: &str,
        viber_name: &str,
    ) -> Result<(), DatabaseError> {
        require("viber_id", viber_id)?;
        require("viber_name", viber_name)?;
        let viber_id = viber_id.to_string();
        let viber_name = viber_name.to_string();
        self.db
            .run(move |conn| {
                let now = now_string();
                diesel::sql_query(
                    "INSERT INTO viber_users (viber_id, viber_name, created_at, updated_at) VALUES (?, ?, ?, ?) \
                     ON CONFLICT(viber_id) DO UPDATE SET viber_name = excluded.viber_name, updated_at = excluded.updated_at",
                )
                .bind::<Text, _>(&viber_id)
                .bind::<Text, _>(&viber_name)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&now)
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from)
            })
            .await
    }

    async fn get_viber_user(&self, viber_id: &str) -> Result<Option<ViberUser>, DatabaseError> {
        let viber_id_param = viber_id.to_string();
        self.db
            .run(move |conn| {
                viber_users::table
                    .filter(viber_users::viber_id.eq(viber_id_param))
                    .select(DbViberUser::as_select())
                    .first::<DbViberUser>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .map(|u| u.to_viber_user())
                    .transpose()
            })
            .await
    }

    async fn get_viber_user_by_matrix_id(
        &self,
        matrix_user_id: &str,
    ) -> Result<Option<ViberUser>, DatabaseError> {
        let matrix_user_id_param = matrix_user_id.to_string();
        self.db
            .run(move |conn| {
                viber_users::table
                    .filter(viber_users::matrix_user_id.eq(matrix_user_id_param))
                    .select(DbViberUser::as_select())
                    .first::<DbViberUser>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .map(|u| u.to_viber_user())
                    .transpose()
            })
            .await
    }

    async fn link_viber_user(
        &self,
        viber_id: &str,
        matrix_user_id: &str,
    ) -> Result<(), DatabaseError> {
        require("viber_id", viber_id)?;
        require("matrix_user_id", matrix_user_id)?;
        let viber_id_param = viber_id.to_string();
        let matrix_user_id_param = matrix_user_id.to_string();
        self.db
            .run(move |conn| {
                conn.transaction::<_, DatabaseError, _>(|conn| {
                    let now = now_string();
                    // an account is linked to at most one Viber user
                    diesel::update(
                        viber_users::table
                            .filter(viber_users::matrix_user_id.eq(matrix_user_id_param.as_str()))
                            .filter(viber_users::viber_id.ne(viber_id_param.as_str())),
                    )
                    .set((
                        viber_users::matrix_user_id.eq(None::<String>),
                        viber_users::updated_at.eq(now.as_str()),
                    ))
                    .execute(conn)?;

                    let updated = diesel::update(
                        viber_users::table.filter(viber_users::viber_id.eq(viber_id_param.as_str())),
                    )
                    .set((
                        viber_users::matrix_user_id.eq(Some(matrix_user_id_param.clone())),
                        viber_users::updated_at.eq(now.as_str()),
                    ))
                    .execute(conn)?;

                    if updated == 0 {
                        return Err(DatabaseError::NotFound(format!(
                            "viber user {viber_id_param}"
                        )));
                    }
                    Ok(())
                })
            })
            .await
    }

    async fn unlink_matrix_user(&self, matrix_user_id: &str) -> Result<(), DatabaseError> {
        // an empty id can never hold a link
        if matrix_user_id.trim().is_empty() {
            return Ok(());
        }
        let matrix_user_id_param = matrix_user_id.to_string();
        self.db
            .run(move |conn| {
                diesel::update(
                    viber_users::table.filter(viber_users::matrix_user_id.eq(matrix_user_id_param)),
                )
                .set((
                    viber_users::matrix_user_id.eq(None::<String>),
                    viber_users::updated_at.eq(now_string()),
                ))
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from)
            })
            .await
    }

    async fn list_linked_users(&self) -> Result<Vec<ViberUser>, DatabaseError> {
        self.db
            .run(move |conn| {
                viber_users::table
                    .filter(viber_users::matrix_user_id.is_not_null())
                    .order(viber_users::viber_id.asc())
                    .select(DbViberUser::as_select())
                    .load::<DbViberUser>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .iter()
                    .map(DbViberUser::to_viber_user)
                    .collect()
            })
            .await
    }
}

pub struct SqliteRoomStore {
    db: SqliteHandle,
    cache: Option<Arc<dyn MappingCache>>,
}

impl SqliteRoomStore {
    pub fn new(db: SqliteHandle, cache: Option<Arc<dyn MappingCache>>) -> Self {
        Self { db, cache }
    }

    fn chat_key(viber_chat_id: &str) -> String {
        format!("room:chat:{viber_chat_id}")
    }

    fn room_key(matrix_room_id: &str) -> String {
        format!("room:matrix:{matrix_room_id}")
    }

    fn cached(&self, key: &str) -> Option<String> {
        self.cache.as_ref().and_then(|cache| cache.get(key))
    }

    fn remember(&self, key: &str, value: &str) {
        if let Some(cache) = &self.cache
            && let Err(err) = cache.put(key, value)
        {
            debug!("mapping cache put skipped key={key}: {err}");
        }
    }

    fn forget(&self, key: &str) {
        if let Some(cache) = &self.cache
            && let Err(err) = cache.invalidate(key)
        {
            debug!("mapping cache invalidation failed key={key}: {err}");
        }
    }
}

#[async_trait]
impl super::RoomStore for SqliteRoomStore {
    async fn get_matrix_room_id(
        &self,
        viber_chat_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let key = Self::chat_key(viber_chat_id);
        if let Some(room_id) = self.cached(&key) {
            return Ok(Some(room_id));
        }

        let chat_id_param = viber_chat_id.to_string();
        let found = self
            .db
            .run(move |conn| {
                room_mappings::table
                    .filter(room_mappings::viber_chat_id.eq(chat_id_param))
                    .select(room_mappings::matrix_room_id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))
            })
            .await?;

        if let Some(room_id) = &found {
            self.remember(&key, room_id);
        }
        Ok(found)
    }

    async fn get_viber_chat_id(
        &self,
        matrix_room_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let key = Self::room_key(matrix_room_id);
        if let Some(chat_id) = self.cached(&key) {
            return Ok(Some(chat_id));
        }

        let room_id_param = matrix_room_id.to_string();
        let found = self
            .db
            .run(move |conn| {
                room_mappings::table
                    .filter(room_mappings::matrix_room_id.eq(room_id_param))
                    .select(room_mappings::viber_chat_id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))
            })
            .await?;

        if let Some(chat_id) = &found {
            self.remember(&key, chat_id);
        }
        Ok(found)
    }

    async fn create_room_mapping(
        &self,
        viber_chat_id: &str,
        matrix_room_id: &str,
    ) -> Result<(), DatabaseError> {
        require("viber_chat_id", viber_chat_id)?;
        require("matrix_room_id", matrix_room_id)?;
        let chat_id = viber_chat_id.to_string();
        let room_id = matrix_room_id.to_string();
        self.db
            .run(move |conn| {
                let new_mapping = NewRoomMapping {
                    viber_chat_id: &chat_id,
                    matrix_room_id: &room_id,
                    created_at: now_string(),
                };
                diesel::insert_into(room_mappings::table)
                    .values(&new_mapping)
                    .execute(conn)
                    .map(|_| ())
                    .map_err(DatabaseError::from)
            })
            .await?;

        self.forget(&Self::chat_key(viber_chat_id));
        self.forget(&Self::room_key(matrix_room_id));
        Ok(())
    }

    async fn list_room_mappings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RoomMapping>, DatabaseError> {
        self.db
            .run(move |conn| {
                room_mappings::table
                    .order(room_mappings::id.asc())
                    .limit(limit)
                    .offset(offset)
                    .select(DbRoomMapping::as_select())
                    .load::<DbRoomMapping>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .iter()
                    .map(DbRoomMapping::to_room_mapping)
                    .collect()
            })
            .await
    }

    async fn count_rooms(&self) -> Result<i64, DatabaseError> {
        self.db
            .run(move |conn| {
                room_mappings::table
                    .count()
                    .get_result::<i64>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))
            })
            .await
    }
}

pub struct SqliteMessageStore {
    db: SqliteHandle,
}

impl SqliteMessageStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl super::MessageStore for SqliteMessageStore {
    async fn store_message_mapping(
        &self,
        viber_message_id: &str,
        matrix_event_id: &str,
        viber_chat_id: &str,
    ) -> Result<(), DatabaseError> {
        require("viber_message_id", viber_message_id)?;
        require("matrix_event_id", matrix_event_id)?;
        require("viber_chat_id", viber_chat_id)?;
        let message_id = viber_message_id.to_string();
        let event_id = matrix_event_id.to_string();
        let chat_id = viber_chat_id.to_string();
        self.db
            .run(move |conn| {
                let now = now_string();
                diesel::sql_query(
                    "INSERT INTO message_mappings (viber_message_id, matrix_event_id, viber_chat_id, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?) \
                     ON CONFLICT(viber_message_id) DO UPDATE SET matrix_event_id = excluded.matrix_event_id, \
                     viber_chat_id = excluded.viber_chat_id, updated_at = excluded.updated_at",
                )
                .bind::<Text, _>(&message_id)
                .bind::<Text, _>(&event_id)
                .bind::<Text, _>(&chat_id)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&now)
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from)
            })
            .await
    }

    async fn get_matrix_event_id(
        &self,
        viber_message_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let message_id_param = viber_message_id.to_string();
        self.db
            .run(move |conn| {
                message_mappings::table
                    .filter(message_mappings::viber_message_id.eq(message_id_param))
                    .select(message_mappings::matrix_event_id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))
            })
            .await
    }

    async fn get_by_matrix_event_id(
        &self,
        matrix_event_id: &str,
    ) -> Result<Option<MessageMapping>, DatabaseError> {
        let event_id_param = matrix_event_id.to_string();
        self.db
            .run(move |conn| {
                message_mappings::table
                    .filter(message_mappings::matrix_event_id.eq(event_id_param))
                    .order(message_mappings::updated_at.desc())
                    .select(DbMessageMapping::as_select())
                    .first::<DbMessageMapping>(conn)
                    .optional()
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .map(|m| m.to_message_mapping())
                    .transpose()
            })
            .await
    }
}

pub struct SqliteMemberStore {
    db: SqliteHandle,
}

impl SqliteMemberStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }
}

#[async_trait]
impl super::MemberStore for SqliteMemberStore {
    async fn upsert_group_member(
        &self,
        viber_chat_id: &str,
        viber_user_id: &str,
        viber_user_name: &str,
    ) -> Result<(), DatabaseError> {
        require("viber_chat_id", viber_chat_id)?;
        require("viber_user_id", viber_user_id)?;
        let chat_id = viber_chat_id.to_string();
        let user_id = viber_user_id.to_string();
        let user_name = viber_user_name.to_string();
        self.db
            .run(move |conn| {
                diesel::sql_query(
                    "INSERT INTO group_members (viber_chat_id, viber_user_id, viber_user_name, joined_at) \
                     VALUES (?, ?, ?, ?) \
                     ON CONFLICT(viber_chat_id, viber_user_id) DO UPDATE SET viber_user_name = excluded.viber_user_name",
                )
                .bind::<Text, _>(&chat_id)
                .bind::<Text, _>(&user_id)
                .bind::<Text, _>(&user_name)
                .bind::<Text, _>(&now_string())
                .execute(conn)
                .map(|_| ())
                .map_err(DatabaseError::from)
            })
            .await
    }

    async fn list_group_members(
        &self,
        viber_chat_id: &str,
    ) -> Result<Vec<GroupMember>, DatabaseError> {
        let chat_id_param = viber_chat_id.to_string();
        self.db
            .run(move |conn| {
                group_members::table
                    .filter(group_members::viber_chat_id.eq(chat_id_param))
                    .order(group_members::joined_at.asc())
                    .select(DbGroupMember::as_select())
                    .load::<DbGroupMember>(conn)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?
                    .iter()
                    .map(DbGroupMember::to_group_member)
                    .collect()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use futures::future::join_all;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::config::{CacheConfig, DatabaseConfig};
    use crate::db::cache::{CacheError, CacheStats};
    use crate::db::{DatabaseManager, RoomStore};

    /// Every write fails, as a full cache does.
    struct FullCache;

    impl MappingCache for FullCache {
        fn get(&self, _key: &str) -> Option<String> {
            None
        }

        fn put(&self, _key: &str, _value: &str) -> Result<(), CacheError> {
            Err(CacheError::Full(0))
        }

        fn invalidate(&self, _key: &str) -> Result<(), CacheError> {
            Err(CacheError::Full(0))
        }

        fn stats(&self) -> CacheStats {
            CacheStats::default()
        }
    }

    fn pool(file: &NamedTempFile, max_size: u32, checkout: Duration) -> SqlitePool {
        Pool::builder()
            .max_size(max_size)
            .connection_timeout(checkout)
            .build(ConnectionManager::<SqliteConnection>::new(
                file.path().to_string_lossy().to_string(),
            ))
            .expect("sqlite pool")
    }

    async fn open(file: &NamedTempFile) -> DatabaseManager {
        let config = DatabaseConfig {
            filename: file.path().to_string_lossy().to_string(),
            max_connections: Some(4),
            ..DatabaseConfig::default()
        };
        let manager = DatabaseManager::new(&config, &CacheConfig::default())
            .await
            .expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
    }

    #[tokio::test]
    async fn upsert_user_is_idempotent() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let users = db.user_store();

        users.upsert_viber_user("u1", "Alice").await.expect("first upsert");
        users.upsert_viber_user("u1", "Alice").await.expect("second upsert");
        users.upsert_viber_user("u1", "Alice B").await.expect("rename");

        let user = users
            .get_viber_user("u1")
            .await
            .expect("query")
            .expect("user exists");
        assert_eq!(user.viber_name, "Alice B");
        assert!(user.matrix_user_id.is_none());
        assert!(user.updated_at >= user.created_at);
    }

    #[tokio::test]
    async fn upsert_user_rejects_empty_fields() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let users = db.user_store();

        let err = users.upsert_viber_user("", "Alice").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidInput(_)));
        let err = users.upsert_viber_user("u1", "").await.unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidInput(_)));
        assert!(users.get_viber_user("u1").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn link_and_unlink_matrix_account() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let users = db.user_store();
        users.upsert_viber_user("u1", "Alice").await.expect("upsert u1");
        users.upsert_viber_user("u2", "Bob").await.expect("upsert u2");

        users
            .link_viber_user("u1", "@alice:example.org")
            .await
            .expect("link");
        let linked = users
            .get_viber_user_by_matrix_id("@alice:example.org")
            .await
            .expect("query")
            .expect("linked user");
        assert_eq!(linked.viber_id, "u1");

        // relinking the same account moves it
        users
            .link_viber_user("u2", "@alice:example.org")
            .await
            .expect("relink");
        let linked = users.list_linked_users().await.expect("list");
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].viber_id, "u2");

        users
            .unlink_matrix_user("@alice:example.org")
            .await
            .expect("unlink");
        assert!(users.list_linked_users().await.expect("list").is_empty());

        users
            .unlink_matrix_user("@nobody:example.org")
            .await
            .expect("unlink without a match is a no-op");
    }

    #[tokio::test]
    async fn unlink_with_empty_id_is_a_no_op() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let users = db.user_store();
        users.upsert_viber_user("u1", "Alice").await.expect("upsert");
        users
            .link_viber_user("u1", "@alice:example.org")
            .await
            .expect("link");

        users.unlink_matrix_user("").await.expect("empty id");
        users.unlink_matrix_user("  ").await.expect("blank id");

        assert_eq!(users.list_linked_users().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn failing_cache_never_fails_room_writes() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        // migrates the schema
        let _db = open(&file).await;
        let cache: Arc<dyn MappingCache> = Arc::new(FullCache);
        let rooms = SqliteRoomStore::new(
            SqliteHandle::new(pool(&file, 2, Duration::from_secs(1)), Duration::from_secs(5)),
            Some(cache),
        );

        rooms.create_room_mapping("c1", "!r").await.expect("mapping");

        assert_eq!(
            rooms.get_matrix_room_id("c1").await.expect("lookup").as_deref(),
            Some("!r")
        );
        assert_eq!(
            rooms.get_viber_chat_id("!r").await.expect("reverse lookup").as_deref(),
            Some("c1")
        );
    }

    #[tokio::test]
    async fn exhausted_pool_is_a_timeout() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let handle = SqliteHandle::new(
            pool(&file, 1, Duration::from_millis(200)),
            Duration::from_secs(5),
        );

        let holder = handle.clone();
        let held = tokio::spawn(async move {
            holder
                .run(|_conn| {
                    std::thread::sleep(Duration::from_millis(800));
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        let err = handle.run(|_conn| Ok(())).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(750));

        held.await.expect("join").expect("held connection released");
    }

    #[tokio::test]
    async fn link_unknown_user_is_not_found() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;

        let err = db
            .user_store()
            .link_viber_user("missing", "@alice:example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn room_mapping_round_trip() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let rooms = db.room_store();

        assert_eq!(rooms.get_matrix_room_id("c1").await.expect("lookup"), None);

        rooms
            .create_room_mapping("c1", "!room1:example.org")
            .await
            .expect("create");
        assert_eq!(
            rooms.get_matrix_room_id("c1").await.expect("lookup").as_deref(),
            Some("!room1:example.org")
        );
        assert_eq!(
            rooms
                .get_viber_chat_id("!room1:example.org")
                .await
                .expect("reverse lookup")
                .as_deref(),
            Some("c1")
        );
        assert_eq!(rooms.count_rooms().await.expect("count"), 1);

        let listed = rooms.list_room_mappings(10, 0).await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].viber_chat_id, "c1");
        assert!(rooms.list_room_mappings(10, 1).await.expect("page").is_empty());
    }

    #[tokio::test]
    async fn duplicate_room_mapping_conflicts() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let rooms = db.room_store();

        rooms
            .create_room_mapping("c1", "!room1:example.org")
            .await
            .expect("create");
        let err = rooms
            .create_room_mapping("c1", "!room2:example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
        let err = rooms
            .create_room_mapping("c2", "!room1:example.org")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        assert_eq!(
            rooms.get_matrix_room_id("c1").await.expect("lookup").as_deref(),
            Some("!room1:example.org")
        );
    }

    #[tokio::test]
    async fn room_lookups_go_through_cache() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let rooms = db.room_store();
        rooms
            .create_room_mapping("c1", "!room1:example.org")
            .await
            .expect("create");

        rooms.get_matrix_room_id("c1").await.expect("first lookup");
        rooms.get_matrix_room_id("c1").await.expect("second lookup");

        let stats = db.cache_stats().expect("cache enabled");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn message_mapping_last_write_wins() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let messages = db.message_store();

        messages
            .store_message_mapping("m1", "$e1", "c1")
            .await
            .expect("first store");
        messages
            .store_message_mapping("m1", "$e2", "c1")
            .await
            .expect("second store");

        assert_eq!(
            messages.get_matrix_event_id("m1").await.expect("lookup").as_deref(),
            Some("$e2")
        );
        assert!(messages.get_by_matrix_event_id("$e1").await.expect("lookup").is_none());
        let mapping = messages
            .get_by_matrix_event_id("$e2")
            .await
            .expect("lookup")
            .expect("mapping");
        assert_eq!(mapping.viber_message_id, "m1");
        assert_eq!(mapping.viber_chat_id, "c1");
        assert_eq!(messages.get_matrix_event_id("m2").await.expect("lookup"), None);
    }

    #[tokio::test]
    async fn concurrent_upserts_for_distinct_users() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;

        let tasks = (0..10).map(|i| {
            let users = db.user_store();
            tokio::spawn(async move {
                users
                    .upsert_viber_user(&format!("user-{i}"), &format!("User {i}"))
                    .await
            })
        });
        for result in join_all(tasks).await {
            result.expect("task joined").expect("upsert");
        }

        let users = db.user_store();
        for i in 0..10 {
            let user = users
                .get_viber_user(&format!("user-{i}"))
                .await
                .expect("query")
                .expect("user exists");
            assert_eq!(user.viber_name, format!("User {i}"));
        }
    }

    #[tokio::test]
    async fn group_members_are_upserted() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db = open(&file).await;
        let members = db.member_store();

        members.upsert_group_member("c1", "u1", "Alice").await.expect("add u1");
        members.upsert_group_member("c1", "u2", "Bob").await.expect("add u2");
        members.upsert_group_member("c1", "u1", "Alice B").await.expect("rename u1");
        members.upsert_group_member("c2", "u1", "Alice").await.expect("other chat");

        let listed = members.list_group_members("c1").await.expect("list");
        assert_eq!(listed.len(), 2);
        let alice = listed
            .iter()
            .find(|m| m.viber_user_id == "u1")
            .expect("alice listed");
        assert_eq!(alice.viber_user_name, "Alice B");
    }
}
