use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use diesel::sqlite::SqliteConnection;
use diesel::RunQueryDsl;
use tracing::info;

use crate::config::{CacheConfig, DatabaseConfig};
use crate::db::sqlite::{
    SqliteHandle, SqliteMemberStore, SqliteMessageStore, SqlitePool, SqliteRoomStore,
    SqliteUserStore,
};
use crate::db::{
    CacheStats, DatabaseError, MappingCache, MemberStore, MemoryCache, MessageStore, RoomStore,
    UserStore,
};

/// Applied to every pooled connection as it is opened.
#[derive(Debug, Clone, Copy)]
struct SqlitePragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

#[derive(Clone)]
pub struct DatabaseManager {
    handle: SqliteHandle,
    cache: Option<Arc<dyn MappingCache>>,
    room_store: Arc<dyn RoomStore>,
    user_store: Arc<dyn UserStore>,
    message_store: Arc<dyn MessageStore>,
    member_store: Arc<dyn MemberStore>,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig, cache: &CacheConfig) -> Result<Self, DatabaseError> {
        let path = config.sqlite_path().to_string();
        if let Some(parent) = Path::new(&path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let max_size = config.max_connections();
        let connection_timeout = config.connection_timeout();
        let pragmas = SqlitePragmas {
            busy_timeout_ms: config.busy_timeout_ms,
        };
        let pool_path = path.clone();
        let pool: SqlitePool = tokio::task::spawn_blocking(move || {
            r2d2::Pool::builder()
                .max_size(max_size)
                .connection_timeout(connection_timeout)
                .connection_customizer(Box::new(pragmas))
                .build(ConnectionManager::<SqliteConnection>::new(pool_path))
        })
        .await
        .map_err(|e| DatabaseError::Connection(format!("pool task failed: {e}")))?
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        info!(
            "sqlite database opened path={} max_connections={}",
            path, max_size
        );

        let cache: Option<Arc<dyn MappingCache>> = if cache.enabled {
            Some(Arc::new(MemoryCache::new(Duration::from_secs(cache.ttl_secs))))
        } else {
            None
        };

        // each store call waits at most one checkout plus one statement
        let handle = SqliteHandle::new(pool, connection_timeout * 2);

        Ok(Self {
            room_store: Arc::new(SqliteRoomStore::new(handle.clone(), cache.clone())),
            user_store: Arc::new(SqliteUserStore::new(handle.clone())),
            message_store: Arc::new(SqliteMessageStore::new(handle.clone())),
            member_store: Arc::new(SqliteMemberStore::new(handle.clone())),
            handle,
            cache,
        })
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        self.handle
            .run(|conn| {
                let statements = [
                    r#"
                    CREATE TABLE IF NOT EXISTS viber_users (
                        viber_id TEXT PRIMARY KEY NOT NULL,
                        viber_name TEXT NOT NULL,
                        matrix_user_id TEXT,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS room_mappings (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        viber_chat_id TEXT NOT NULL UNIQUE,
                        matrix_room_id TEXT NOT NULL UNIQUE,
                        created_at TEXT NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS message_mappings (
                        id INTEGER PRIMARY KEY AUTOINCREMENT,
                        viber_message_id TEXT NOT NULL UNIQUE,
                        matrix_event_id TEXT NOT NULL,
                        viber_chat_id TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    )
                    "#,
                    r#"
                    CREATE TABLE IF NOT EXISTS group_members (
                        viber_chat_id TEXT NOT NULL,
                        viber_user_id TEXT NOT NULL,
                        viber_user_name TEXT NOT NULL,
                        joined_at TEXT NOT NULL,
                        PRIMARY KEY (viber_chat_id, viber_user_id)
                    )
                    "#,
                    "CREATE INDEX IF NOT EXISTS idx_viber_users_matrix_id ON viber_users(matrix_user_id)",
                    "CREATE INDEX IF NOT EXISTS idx_message_mappings_matrix_event ON message_mappings(matrix_event_id)",
                    "CREATE INDEX IF NOT EXISTS idx_message_mappings_chat ON message_mappings(viber_chat_id)",
                ];

                for statement in statements {
                    diesel::sql_query(statement)
                        .execute(conn)
                        .map_err(|e| DatabaseError::Migration(e.to_string()))?;
                }
                Ok(())
            })
            .await
    }

    pub async fn ping(&self) -> Result<(), DatabaseError> {
        self.handle
            .run(|conn| {
                diesel::sql_query("SELECT 1")
                    .execute(conn)
                    .map(|_| ())
                    .map_err(|e| DatabaseError::Connection(e.to_string()))
            })
            .await
    }

    pub fn room_store(&self) -> Arc<dyn RoomStore> {
        self.room_store.clone()
    }

    pub fn user_store(&self) -> Arc<dyn UserStore> {
        self.user_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn member_store(&self) -> Arc<dyn MemberStore> {
        self.member_store.clone()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::DatabaseManager;
    use crate::config::{CacheConfig, DatabaseConfig};

    fn test_config(path: &str) -> DatabaseConfig {
        DatabaseConfig {
            filename: path.to_string(),
            max_connections: Some(4),
            ..DatabaseConfig::default()
        }
    }

    #[tokio::test]
    async fn message_mapping_survives_reopen() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let db_path = file.path().to_string_lossy().to_string();
        let config = test_config(&db_path);
        let cache = CacheConfig::default();

        let manager = DatabaseManager::new(&config, &cache).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        manager
            .message_store()
            .store_message_mapping("viber-msg-1", "$event1", "chat-1")
            .await
            .expect("insert mapping");

        let reopened = DatabaseManager::new(&config, &cache)
            .await
            .expect("db manager reopened");
        reopened.migrate().await.expect("migrate is idempotent");

        let persisted = reopened
            .message_store()
            .get_matrix_event_id("viber-msg-1")
            .await
            .expect("query after reopen");
        assert_eq!(persisted.as_deref(), Some("$event1"));
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_database() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = test_config(&file.path().to_string_lossy());
        let manager = DatabaseManager::new(&config, &CacheConfig::default())
            .await
            .expect("db manager");
        manager.ping().await.expect("ping");
        assert!(manager.cache_stats().is_some());
    }

    #[tokio::test]
    async fn cache_can_be_disabled() {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = test_config(&file.path().to_string_lossy());
        let cache = CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        };
        let manager = DatabaseManager::new(&config, &cache).await.expect("db manager");
        assert!(manager.cache_stats().is_none());
    }
}
