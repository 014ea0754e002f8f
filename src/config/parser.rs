use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub viber: ViberConfig,
    #[serde(default)]
    pub matrix: MatrixConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ViberConfig {
    #[serde(default)]
    pub api_token: String,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_viber_api_base_url")]
    pub api_base_url: String,
    /// Key for webhook signatures. Viber signs with the bot token, so this
    /// only needs to be set when a proxy re-signs requests.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default)]
    pub allow_unsigned: bool,
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    #[serde(default)]
    pub sender_avatar: Option<String>,
    #[serde(default)]
    pub default_receiver_id: Option<String>,
    #[serde(default = "default_event_types")]
    pub event_types: Vec<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for ViberConfig {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            webhook_url: String::new(),
            api_base_url: default_viber_api_base_url(),
            webhook_secret: None,
            allow_unsigned: false,
            sender_name: default_sender_name(),
            sender_avatar: None,
            default_receiver_id: None,
            event_types: default_event_types(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl ViberConfig {
    pub fn signing_secret(&self) -> &str {
        self.webhook_secret
            .as_deref()
            .filter(|secret| !secret.is_empty())
            .unwrap_or(&self.api_token)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixConfig {
    #[serde(default)]
    pub homeserver_url: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub default_room_id: Option<String>,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub invite_users: Vec<String>,
    #[serde(default = "default_create_portal_rooms")]
    pub create_portal_rooms: bool,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            homeserver_url: String::new(),
            access_token: String::new(),
            default_room_id: None,
            admin_users: Vec::new(),
            invite_users: Vec::new(),
            create_portal_rooms: default_create_portal_rooms(),
            sync_timeout_ms: default_sync_timeout_ms(),
        }
    }
}

impl MatrixConfig {
    pub fn is_configured(&self) -> bool {
        !self.homeserver_url.is_empty() && !self.access_token.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_max_media_bytes")]
    pub max_media_bytes: usize,
    /// Sustained webhook requests per second and client IP. 0 disables the
    /// limiter.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_body_bytes: default_max_body_bytes(),
            max_media_bytes: default_max_media_bytes(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl BridgeConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Requests allowed per client and the window they refill over, so the
    /// burst drains at the sustained rate.
    pub fn webhook_rate_limit(&self) -> Option<(usize, Duration)> {
        if self.rate_limit_per_sec == 0 {
            return None;
        }
        let burst = self.rate_limit_burst.max(1);
        let window_ms = u64::from(burst) * 1000 / u64::from(self.rate_limit_per_sec);
        Some((burst as usize, Duration::from_millis(window_ms.max(1))))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_filename", alias = "path")]
    pub filename: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            filename: default_database_filename(),
            max_connections: None,
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub const MAX_POOL_SIZE: u32 = 25;

    pub fn sqlite_path(&self) -> String {
        self.filename
            .strip_prefix("sqlite://")
            .unwrap_or(&self.filename)
            .to_string()
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
            .unwrap_or(10)
            .clamp(1, Self::MAX_POOL_SIZE)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Reads the YAML file (a missing file yields defaults), applies
    /// environment overrides, then validates.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_yaml(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub(crate) fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = var("VIBER_API_TOKEN") {
            self.viber.api_token = value;
        }
        if let Some(value) = var("VIBER_WEBHOOK_URL") {
            self.viber.webhook_url = value;
        }
        if let Some(value) = var("VIBER_API_BASE_URL") {
            self.viber.api_base_url = value;
        }
        if let Some(value) = var("VIBER_DEFAULT_RECEIVER_ID") {
            self.viber.default_receiver_id = Some(value);
        }
        if let Some(value) = var("MATRIX_HOMESERVER_URL") {
            self.matrix.homeserver_url = value;
        }
        if let Some(value) = var("MATRIX_ACCESS_TOKEN") {
            self.matrix.access_token = value;
        }
        if let Some(value) = var("MATRIX_DEFAULT_ROOM_ID") {
            self.matrix.default_room_id = Some(value);
        }
        if let Some(value) = var("LISTEN_ADDRESS") {
            self.apply_listen_address(&value);
        }
        if let Some(value) = var("DATABASE_PATH") {
            self.database.filename = value;
        }
        if let Some(secs) = var("HTTP_CLIENT_TIMEOUT").and_then(|v| parse_seconds(&v)) {
            self.viber.http_timeout_secs = secs;
        }
        if let Some(secs) = var("CACHE_TTL").and_then(|v| parse_seconds(&v)) {
            self.cache.ttl_secs = secs;
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.logging.level = value;
        }
    }

    fn apply_listen_address(&mut self, value: &str) {
        let Some((host, port)) = value.rsplit_once(':') else {
            return;
        };
        if let Ok(port) = port.parse::<u16>() {
            self.bridge.port = port;
        }
        if !host.is_empty() {
            self.bridge.bind_address = host.to_string();
        }
    }
}

/// Accepts plain seconds (`15`) or a seconds suffix (`15s`).
fn parse_seconds(value: &str) -> Option<u64> {
    let value = value.trim();
    value.strip_suffix('s').unwrap_or(value).parse().ok()
}

fn default_viber_api_base_url() -> String {
    "https://chatapi.viber.com".to_string()
}

fn default_sender_name() -> String {
    "Matrix Bridge".to_string()
}

fn default_event_types() -> Vec<String> {
    [
        "delivered",
        "seen",
        "failed",
        "subscribed",
        "unsubscribed",
        "conversation_started",
    ]
    .into_iter()
    .map(ToOwned::to_owned)
    .collect()
}

fn default_http_timeout_secs() -> u64 {
    15
}

fn default_create_portal_rooms() -> bool {
    true
}

fn default_sync_timeout_ms() -> u64 {
    30000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_max_media_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_rate_limit_per_sec() -> u32 {
    5
}

fn default_rate_limit_burst() -> u32 {
    10
}

fn default_database_filename() -> String {
    "./data/bridge.db".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
