pub use self::cache::{CacheStats, MappingCache, MemoryCache};
pub use self::error::DatabaseError;
pub use self::manager::DatabaseManager;
pub use self::stores::{MemberStore, MessageStore, RoomStore, UserStore};

pub mod cache;
pub mod error;
pub mod manager;
pub mod models;
pub mod schema_sqlite;
pub mod sqlite;
pub mod stores;
