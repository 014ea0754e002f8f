pub use self::parser::{
    BridgeConfig, CacheConfig, Config, DatabaseConfig, LoggingConfig, MatrixConfig, ViberConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
