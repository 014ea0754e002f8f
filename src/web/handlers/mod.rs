pub mod health;
pub mod metrics;
pub mod provisioning;
pub mod webhook;

pub use self::health::{HealthHandler, ReadyHandler};
pub use self::metrics::MetricsHandler;
pub use self::provisioning::{ListMembersHandler, ListRoomsHandler};
pub use self::webhook::WebhookHandler;
