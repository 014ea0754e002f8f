use thiserror::Error;

use super::Config;
use crate::utils::validation::{
    is_https_url, is_valid_http_url, is_valid_matrix_room_id, is_valid_matrix_user_id,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.viber.api_token.trim().is_empty() {
            return Err(invalid("viber.api_token cannot be empty"));
        }

        if self.viber.webhook_url.trim().is_empty() {
            return Err(invalid("viber.webhook_url cannot be empty"));
        }
        if !is_https_url(&self.viber.webhook_url) {
            return Err(invalid("viber.webhook_url must be an https URL"));
        }

        if !is_valid_http_url(&self.viber.api_base_url) {
            return Err(invalid("viber.api_base_url must be an http(s) URL"));
        }

        let matrix = &self.matrix;
        if !matrix.homeserver_url.is_empty() || !matrix.access_token.is_empty() {
            if matrix.homeserver_url.is_empty() || matrix.access_token.is_empty() {
                return Err(invalid(
                    "matrix.homeserver_url and matrix.access_token must be set together",
                ));
            }
            if !is_valid_http_url(&matrix.homeserver_url) {
                return Err(invalid("matrix.homeserver_url must be an http(s) URL"));
            }
        }

        if let Some(room_id) = &matrix.default_room_id
            && !is_valid_matrix_room_id(room_id)
        {
            return Err(invalid(format!(
                "matrix.default_room_id is not a valid room id: {room_id}"
            )));
        }

        for (field, users) in [
            ("matrix.admin_users", &matrix.admin_users),
            ("matrix.invite_users", &matrix.invite_users),
        ] {
            if let Some(user) = users.iter().find(|user| !is_valid_matrix_user_id(user)) {
                return Err(invalid(format!("{field} has an invalid user id: {user}")));
            }
        }

        if self.bridge.port == 0 {
            return Err(invalid("bridge.port must be between 1 and 65535"));
        }

        if self.bridge.request_timeout_ms == 0 {
            return Err(invalid("bridge.request_timeout_ms must be positive"));
        }

        if self.database.filename.trim().is_empty() {
            return Err(invalid("database.filename cannot be empty"));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(invalid(format!(
                    "logging.format must be pretty or json, got {other}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.viber.api_token = "token".to_string();
        config.viber.webhook_url = "https://bridge.example.org/webhook".to_string();
        config
    }

    #[test]
    fn minimal_config_is_valid() {
        valid().validate().expect("minimal config");
    }

    #[test_case(|c: &mut Config| c.viber.api_token.clear() ; "missing token")]
    #[test_case(|c: &mut Config| c.viber.webhook_url = "http://bridge.example.org/webhook".into() ; "plain http webhook")]
    #[test_case(|c: &mut Config| c.matrix.homeserver_url = "https://matrix.example.org".into() ; "homeserver without token")]
    #[test_case(|c: &mut Config| c.matrix.access_token = "syt".into() ; "token without homeserver")]
    #[test_case(|c: &mut Config| c.matrix.default_room_id = Some("room".into()) ; "bad default room")]
    #[test_case(|c: &mut Config| c.matrix.admin_users = vec!["alice".into()] ; "bad admin user")]
    #[test_case(|c: &mut Config| c.bridge.port = 0 ; "zero port")]
    #[test_case(|c: &mut Config| c.logging.format = "xml".into() ; "unknown log format")]
    fn rejects(mutate: fn(&mut Config)) {
        let mut config = valid();
        mutate(&mut config);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn accepts_complete_matrix_section() {
        let mut config = valid();
        config.matrix.homeserver_url = "https://matrix.example.org".to_string();
        config.matrix.access_token = "syt_token".to_string();
        config.matrix.default_room_id = Some("!abc123:example.org".to_string());
        config.matrix.invite_users = vec!["@alice:example.org".to_string()];
        config.validate().expect("matrix config");
    }
}
