use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{DatabaseError, DatabaseManager};
use crate::viber::payload::{self, DecodeError};
use crate::viber::{InboundMessage, MessageContent, SignatureError, SignatureVerifier, ViberEvent};
use crate::web::metrics::BridgeMetrics;

pub mod capabilities;
pub mod commands;
pub mod logic;

use self::capabilities::{MatrixPort, MediaFetcher, MediaKind, SendError};
use self::logic::{format_contact, format_location, format_viber_text, portal_room_name, portal_topic};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] SignatureError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    #[error("forward failed: {0}")]
    TransientForward(String),
    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl From<SendError> for RelayError {
    fn from(err: SendError) -> Self {
        RelayError::TransientForward(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Duplicate,
    UnknownEvent,
    UnknownContent,
    NoRoom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Routed { room_id: String, event_id: String },
    /// Only the mapping store was touched.
    Recorded,
    Ignored(IgnoreReason),
}

/// Status and short body returned to Viber. Bodies never echo the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressReply {
    pub status: u16,
    pub body: &'static str,
}

impl IngressReply {
    pub const OK: Self = Self { status: 200, body: "ok" };
    pub const UNAUTHORIZED: Self = Self { status: 401, body: "unauthorized" };
    pub const BAD_REQUEST: Self = Self { status: 400, body: "bad request" };
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub create_portal_rooms: bool,
    pub default_room_id: Option<String>,
    pub request_timeout: Duration,
}

struct PortalRoom {
    room_id: String,
    /// False when falling back to the default room, which has no mapping row.
    mapped: bool,
}

pub struct BridgeCore {
    verifier: SignatureVerifier,
    db: DatabaseManager,
    matrix: Option<Arc<dyn MatrixPort>>,
    media: Option<Arc<dyn MediaFetcher>>,
    settings: RelaySettings,
    metrics: Arc<BridgeMetrics>,
}

impl BridgeCore {
    pub fn new(
        verifier: SignatureVerifier,
        db: DatabaseManager,
        matrix: Option<Arc<dyn MatrixPort>>,
        media: Option<Arc<dyn MediaFetcher>>,
        settings: RelaySettings,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            verifier,
            db,
            matrix,
            media,
            settings,
            metrics,
        }
    }

    /// Verify, decode and dispatch one webhook call. Dispatch runs on its own
    /// task so a dropped connection does not abort a half-done relay.
    pub async fn handle_webhook(self: &Arc<Self>, body: Vec<u8>, signature: Option<&str>) -> IngressReply {
        self.metrics.webhook_received();

        if let Err(err) = self.verifier.verify(&body, signature) {
            warn!("viber webhook rejected reason=signature: {err}");
            self.metrics.webhook_rejected_signature();
            return IngressReply::UNAUTHORIZED;
        }

        let event = match payload::decode(&body) {
            Ok(event) => event,
            Err(err) => {
                warn!("viber webhook rejected reason=decode: {err}");
                self.metrics.webhook_rejected_decode();
                return IngressReply::BAD_REQUEST;
            }
        };

        let core = Arc::clone(self);
        let deadline = self.settings.request_timeout;
        let task = tokio::spawn(async move {
            let kind = event.kind().to_string();
            let result = match tokio::time::timeout(deadline, core.dispatch(event)).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::TransientForward(format!(
                    "deadline of {}ms exceeded",
                    deadline.as_millis()
                ))),
            };
            core.record_outcome(&kind, result);
        });
        if let Err(err) = task.await {
            error!("viber dispatch task failed: {err}");
        }

        IngressReply::OK
    }

    fn record_outcome(&self, kind: &str, result: Result<RelayOutcome, RelayError>) {
        match result {
            Ok(RelayOutcome::Routed { room_id, event_id }) => {
                self.metrics.event_routed();
                debug!("viber {kind} routed room_id={room_id} event_id={event_id}");
            }
            Ok(RelayOutcome::Recorded) => {
                self.metrics.event_ignored();
                debug!("viber {kind} recorded");
            }
            Ok(RelayOutcome::Ignored(reason)) => {
                self.metrics.event_ignored();
                debug!("viber {kind} ignored reason={reason:?}");
            }
            Err(RelayError::NotConfigured(what)) => {
                self.metrics.event_ignored();
                info!("viber {kind} dropped reason=not_configured target={what}");
            }
            Err(RelayError::NotImplemented(what)) => {
                self.metrics.event_ignored();
                debug!("viber {kind} dropped reason=not_implemented target={what}");
            }
            Err(err @ RelayError::Storage(_)) => {
                self.metrics.viber_forward_failed();
                error!("viber {kind} dropped: {err}");
            }
            Err(err) => {
                self.metrics.viber_forward_failed();
                warn!("viber {kind} forward failed: {err}");
            }
        }
    }

    pub async fn dispatch(&self, event: ViberEvent) -> Result<RelayOutcome, RelayError> {
        match event {
            ViberEvent::Message(message) => self.relay_message(message).await,
            ViberEvent::Subscribed { user } | ViberEvent::ConversationStarted { user, .. } => {
                self.db
                    .user_store()
                    .upsert_viber_user(&user.id, user.display_name())
                    .await?;
                Ok(RelayOutcome::Recorded)
            }
            ViberEvent::Unsubscribed { user_id } => {
                info!("viber user unsubscribed user_id={user_id}");
                Ok(RelayOutcome::Recorded)
            }
            ViberEvent::Unknown { event } => {
                debug!("viber event ignored event={event}");
                Ok(RelayOutcome::Ignored(IgnoreReason::UnknownEvent))
            }
        }
    }

    async fn relay_message(&self, message: InboundMessage) -> Result<RelayOutcome, RelayError> {
        let sender_id = message.sender.id.as_str();
        let sender_name = message.sender.display_name();
        self.db
            .user_store()
            .upsert_viber_user(sender_id, sender_name)
            .await?;

        if let MessageContent::Unknown { kind } = &message.content {
            debug!("viber message ignored chat_id={} kind={kind}", message.chat_id);
            return Ok(RelayOutcome::Ignored(IgnoreReason::UnknownContent));
        }
        // nothing to forward, so no portal room either
        if let MessageContent::Sticker { media: None, .. } = &message.content {
            return Err(RelayError::NotImplemented("sticker without media"));
        }

        let matrix = self
            .matrix
            .as_deref()
            .ok_or(RelayError::NotConfigured("matrix client"))?;

        if let Some(token) = &message.message_token
            && self
                .db
                .message_store()
                .get_matrix_event_id(token)
                .await?
                .is_some()
        {
            return Ok(RelayOutcome::Ignored(IgnoreReason::Duplicate));
        }

        let Some(portal) = self.resolve_portal(matrix, &message).await? else {
            return Ok(RelayOutcome::Ignored(IgnoreReason::NoRoom));
        };

        if portal.mapped
            && let Err(err) = self
                .db
                .member_store()
                .upsert_group_member(&message.chat_id, sender_id, sender_name)
                .await
        {
            warn!(
                "group member upsert failed chat_id={} user_id={}: {err}",
                message.chat_id, sender_id
            );
        }

        let event_id = self
            .forward(matrix, &portal.room_id, sender_name, &message.content)
            .await?;

        if portal.mapped
            && let Some(token) = &message.message_token
            && let Err(err) = self
                .db
                .message_store()
                .store_message_mapping(token, &event_id, &message.chat_id)
                .await
        {
            warn!("message mapping write failed token={token} event_id={event_id}: {err}");
        }

        Ok(RelayOutcome::Routed {
            room_id: portal.room_id,
            event_id,
        })
    }

    /// Existing mapping, else a new portal room, else the default room.
    async fn resolve_portal(
        &self,
        matrix: &dyn MatrixPort,
        message: &InboundMessage,
    ) -> Result<Option<PortalRoom>, RelayError> {
        let rooms = self.db.room_store();
        if let Some(room_id) = rooms.get_matrix_room_id(&message.chat_id).await? {
            return Ok(Some(PortalRoom {
                room_id,
                mapped: true,
            }));
        }

        if !self.settings.create_portal_rooms {
            return Ok(self.settings.default_room_id.clone().map(|room_id| PortalRoom {
                room_id,
                mapped: false,
            }));
        }

        let room_id = matrix
            .create_room(&portal_room_name(message), &portal_topic(&message.chat_id))
            .await?;

        match rooms.create_room_mapping(&message.chat_id, &room_id).await {
            Ok(()) => {
                info!(
                    "portal room created chat_id={} room_id={}",
                    message.chat_id, room_id
                );
                Ok(Some(PortalRoom {
                    room_id,
                    mapped: true,
                }))
            }
            Err(DatabaseError::Conflict(detail)) => {
                warn!(
                    "portal room orphaned chat_id={} room_id={}: concurrent mapping won",
                    message.chat_id, room_id
                );
                match rooms.get_matrix_room_id(&message.chat_id).await? {
                    Some(winner) => Ok(Some(PortalRoom {
                        room_id: winner,
                        mapped: true,
                    })),
                    None => Err(RelayError::Storage(DatabaseError::Conflict(detail))),
                }
            }
            Err(err) => {
                error!(
                    "portal room orphaned chat_id={} room_id={}: {err}",
                    message.chat_id, room_id
                );
                Err(err.into())
            }
        }
    }

    async fn forward(
        &self,
        matrix: &dyn MatrixPort,
        room_id: &str,
        sender_name: &str,
        content: &MessageContent,
    ) -> Result<String, RelayError> {
        let text = match content {
            MessageContent::Text { text } => text.clone(),
            MessageContent::Location { lat, lon } => format_location(*lat, *lon),
            MessageContent::Contact { name, phone } => format_contact(name, phone),
            MessageContent::Picture {
                media,
                caption,
                file_name,
            } => {
                return self
                    .forward_media(
                        matrix,
                        room_id,
                        sender_name,
                        MediaKind::Image,
                        media,
                        file_name.as_deref(),
                        caption.as_deref(),
                    )
                    .await;
            }
            MessageContent::Video { media, caption, .. } => {
                return self
                    .forward_media(
                        matrix,
                        room_id,
                        sender_name,
                        MediaKind::Video,
                        media,
                        None,
                        caption.as_deref(),
                    )
                    .await;
            }
            MessageContent::File {
                media, file_name, ..
            } => {
                return self
                    .forward_media(
                        matrix,
                        room_id,
                        sender_name,
                        MediaKind::File,
                        media,
                        file_name.as_deref(),
                        None,
                    )
                    .await;
            }
            MessageContent::Sticker {
                media: Some(media), ..
            } => {
                return self
                    .forward_media(
                        matrix,
                        room_id,
                        sender_name,
                        MediaKind::Image,
                        media,
                        None,
                        None,
                    )
                    .await;
            }
            MessageContent::Sticker { media: None, .. } => {
                return Err(RelayError::NotImplemented("sticker without media"));
            }
            MessageContent::Unknown { .. } => {
                return Err(RelayError::NotImplemented("unknown content"));
            }
        };

        Ok(matrix
            .send_text(room_id, &format_viber_text(sender_name, &text))
            .await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward_media(
        &self,
        matrix: &dyn MatrixPort,
        room_id: &str,
        sender_name: &str,
        kind: MediaKind,
        url: &str,
        file_name: Option<&str>,
        caption: Option<&str>,
    ) -> Result<String, RelayError> {
        let fetcher = self
            .media
            .as_deref()
            .ok_or(RelayError::NotConfigured("media fetcher"))?;
        let media = fetcher.fetch(url, file_name).await?;
        let event_id = matrix.send_media(room_id, kind, media).await?;

        if let Some(caption) = caption
            && let Err(err) = matrix
                .send_text(room_id, &format_viber_text(sender_name, caption))
                .await
        {
            warn!("caption forward failed room_id={room_id} event_id={event_id}: {err}");
        }
        Ok(event_id)
    }
}
