use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::db::{DatabaseError, DatabaseManager};

pub const COMMAND_PREFIX: &str = "!bridge";

const HELP_TEXT: &str = "Available commands:\n\
!bridge link <viber-user-id> - link your Matrix account to a Viber user\n\
!bridge unlink - remove the link from your Matrix account\n\
!bridge status - show bridge status\n\
!bridge ping - check that the bridge is responding\n\
!bridge help - show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    Link(Option<String>),
    Unlink,
    Status,
    Help,
    Ping,
    Unknown(String),
}

/// Parses `!bridge <command> [args]`. Returns `None` for ordinary messages.
pub fn parse_command(body: &str) -> Option<BridgeCommand> {
    let mut parts = body.split_whitespace();
    if parts.next()? != COMMAND_PREFIX {
        return None;
    }
    let command = match parts.next() {
        None | Some("help") => BridgeCommand::Help,
        Some("link") => BridgeCommand::Link(parts.next().map(ToOwned::to_owned)),
        Some("unlink") => BridgeCommand::Unlink,
        Some("status") => BridgeCommand::Status,
        Some("ping") => BridgeCommand::Ping,
        Some(other) => BridgeCommand::Unknown(other.to_string()),
    };
    Some(command)
}

pub struct CommandHandler {
    db: DatabaseManager,
    admin_users: Vec<String>,
    webhook_registered: Arc<AtomicBool>,
}

impl CommandHandler {
    pub fn new(
        db: DatabaseManager,
        admin_users: Vec<String>,
        webhook_registered: Arc<AtomicBool>,
    ) -> Self {
        Self {
            db,
            admin_users,
            webhook_registered,
        }
    }

    fn is_allowed(&self, sender: &str) -> bool {
        self.admin_users.is_empty() || self.admin_users.iter().any(|user| user == sender)
    }

    /// Runs a command for `sender` and returns the reply text.
    pub async fn handle(&self, sender: &str, command: BridgeCommand) -> String {
        if !self.is_allowed(sender) {
            warn!("bridge command denied sender={sender} command={command:?}");
            return "You don't have permission to run bridge commands.".to_string();
        }

        match command {
            BridgeCommand::Link(None) => "Usage: !bridge link <viber-user-id>".to_string(),
            BridgeCommand::Link(Some(viber_id)) => self.link(sender, &viber_id).await,
            BridgeCommand::Unlink => self.unlink(sender).await,
            BridgeCommand::Status => self.status().await,
            BridgeCommand::Help => HELP_TEXT.to_string(),
            BridgeCommand::Ping => "pong".to_string(),
            BridgeCommand::Unknown(other) => {
                format!("Unknown command: {other}. Use !bridge help")
            }
        }
    }

    async fn link(&self, sender: &str, viber_id: &str) -> String {
        let users = self.db.user_store();
        let not_found = || {
            format!("Viber user {viber_id} not found. They need to send a message first.")
        };
        let user = match users.get_viber_user(viber_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return not_found(),
            Err(err) => return format!("Failed to look up Viber user: {err}"),
        };

        match users.link_viber_user(viber_id, sender).await {
            Ok(()) => {
                info!("matrix user linked matrix_user_id={sender} viber_id={viber_id}");
                format!("Linked {sender} to Viber user {} ({viber_id}).", user.viber_name)
            }
            Err(DatabaseError::NotFound(_)) => not_found(),
            Err(err) => format!("Failed to link: {err}"),
        }
    }

    async fn unlink(&self, sender: &str) -> String {
        let users = self.db.user_store();
        let user = match users.get_viber_user_by_matrix_id(sender).await {
            Ok(Some(user)) => user,
            Ok(None) => return "You don't have a linked Viber account.".to_string(),
            Err(err) => return format!("Failed to look up link: {err}"),
        };
        match users.unlink_matrix_user(sender).await {
            Ok(()) => {
                info!("matrix user unlinked matrix_user_id={sender} viber_id={}", user.viber_id);
                format!("Unlinked Viber user {} ({}).", user.viber_name, user.viber_id)
            }
            Err(err) => format!("Failed to unlink: {err}"),
        }
    }

    async fn status(&self) -> String {
        let database = match self.db.ping().await {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("error ({err})"),
        };
        let webhook = if self.webhook_registered.load(Ordering::Relaxed) {
            "registered"
        } else {
            "not registered"
        };
        let rooms = self
            .db
            .room_store()
            .count_rooms()
            .await
            .map(|count| count.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let linked = self
            .db
            .user_store()
            .list_linked_users()
            .await
            .map(|users| users.len().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        format!(
            "Bridge status:\nMatrix: connected\nDatabase: {database}\nViber webhook: {webhook}\nBridged chats: {rooms}\nLinked users: {linked}"
        )
    }
}
