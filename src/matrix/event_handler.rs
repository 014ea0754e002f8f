use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{MatrixEvent, media_download_url};
use crate::bridge::capabilities::{OutboundContent, RoomSender, ViberSender};
use crate::bridge::commands::{CommandHandler, parse_command};
use crate::bridge::logic::{parse_geo_uri, render_for_viber};
use crate::db::{DatabaseError, DatabaseManager};
use crate::web::metrics::BridgeMetrics;

const AGE_LIMIT_MS: i64 = 900000;
/// Viber rejects picture captions longer than this.
const PICTURE_CAPTION_MAX_CHARS: usize = 120;

#[derive(Debug, Default, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    msgtype: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    formatted_body: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    info: Option<MediaInfo>,
    #[serde(default)]
    geo_uri: Option<String>,
}

impl MessageContent {
    fn size(&self) -> u64 {
        self.info.as_ref().and_then(|info| info.size).unwrap_or(0)
    }
}

/// Where Matrix messages without a mapped chat end up.
#[derive(Debug, Clone, Default)]
pub struct DefaultRoute {
    pub room_id: Option<String>,
    pub receiver_id: Option<String>,
}

impl DefaultRoute {
    fn receiver_for(&self, room_id: &str) -> Option<&str> {
        match (&self.room_id, &self.receiver_id) {
            (Some(room), Some(receiver)) if room == room_id => Some(receiver.as_str()),
            _ => None,
        }
    }
}

pub struct MatrixEventProcessor {
    own_user_id: String,
    homeserver: Url,
    db: DatabaseManager,
    viber: Arc<dyn ViberSender>,
    replies: Arc<dyn RoomSender>,
    commands: CommandHandler,
    default_route: DefaultRoute,
    metrics: Arc<BridgeMetrics>,
}

impl MatrixEventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        own_user_id: impl Into<String>,
        homeserver: Url,
        db: DatabaseManager,
        viber: Arc<dyn ViberSender>,
        replies: Arc<dyn RoomSender>,
        commands: CommandHandler,
        default_route: DefaultRoute,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            own_user_id: own_user_id.into(),
            homeserver,
            db,
            viber,
            replies,
            commands,
            default_route,
            metrics,
        }
    }

    fn check_event_age(event: &MatrixEvent) -> bool {
        if let Some(ts) = event.timestamp {
            let now = chrono::Utc::now().timestamp_millis();
            if ts > now {
                debug!("event timestamp is in the future, allowing event_id={:?}", event.event_id);
                return true;
            }
            let age = now - ts;
            if age > AGE_LIMIT_MS {
                info!(
                    "skipping event due to age {}ms > {}ms event_id={:?} room_id={} type={}",
                    age, AGE_LIMIT_MS, event.event_id, event.room_id, event.event_type
                );
                return false;
            }
        }
        true
    }

    /// Media becomes a native Viber message pointing at the homeserver
    /// download URL. Anything without a usable URL or location falls back
    /// to the text rendering.
    fn outbound_content(&self, content: &MessageContent) -> Option<OutboundContent> {
        let media_url = || {
            content
                .url
                .as_deref()
                .and_then(|mxc| media_download_url(&self.homeserver, mxc))
        };
        let native = match content.msgtype.as_str() {
            "m.image" => media_url().map(|url| OutboundContent::Picture {
                url,
                caption: content.body.chars().take(PICTURE_CAPTION_MAX_CHARS).collect(),
            }),
            "m.video" => media_url().map(|url| OutboundContent::Video {
                url,
                size: content.size(),
            }),
            "m.file" | "m.audio" => media_url().map(|url| OutboundContent::File {
                url,
                file_name: content
                    .filename
                    .clone()
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| content.body.clone()),
                size: content.size(),
            }),
            "m.location" => content
                .geo_uri
                .as_deref()
                .and_then(parse_geo_uri)
                .map(|(lat, lon)| OutboundContent::Location { lat, lon }),
            _ => None,
        };
        if native.is_some() {
            return native;
        }

        let text = render_for_viber(
            &content.msgtype,
            &content.body,
            content.format.as_deref(),
            content.formatted_body.as_deref(),
        );
        (!text.is_empty()).then_some(OutboundContent::Text(text))
    }

    pub async fn process_event(&self, event: MatrixEvent) -> Result<(), DatabaseError> {
        if event.sender == self.own_user_id {
            return Ok(());
        }
        if event.event_type != "m.room.message" {
            debug!("ignoring matrix event type={}", event.event_type);
            return Ok(());
        }
        if !Self::check_event_age(&event) {
            return Ok(());
        }

        let content: MessageContent = match serde_json::from_value(event.content.clone()) {
            Ok(content) => content,
            Err(err) => {
                debug!("matrix message without usable content event_id={:?}: {err}", event.event_id);
                return Ok(());
            }
        };

        if content.msgtype == "m.text"
            && let Some(command) = parse_command(&content.body)
        {
            let reply = self.commands.handle(&event.sender, command).await;
            if let Err(err) = self.replies.send_text(&event.room_id, &reply).await {
                warn!("bridge command reply failed room_id={}: {err}", event.room_id);
            }
            return Ok(());
        }

        if let Some(event_id) = &event.event_id
            && self
                .db
                .message_store()
                .get_by_matrix_event_id(event_id)
                .await?
                .is_some()
        {
            debug!("skipping event relayed from viber event_id={event_id}");
            return Ok(());
        }

        let receiver = match self.db.room_store().get_viber_chat_id(&event.room_id).await? {
            Some(chat_id) => chat_id,
            None => match self.default_route.receiver_for(&event.room_id) {
                Some(receiver) => receiver.to_string(),
                None => {
                    debug!("no viber chat for matrix room room_id={}", event.room_id);
                    return Ok(());
                }
            },
        };

        let Some(outbound) = self.outbound_content(&content) else {
            return Ok(());
        };

        match self.viber.send(&receiver, outbound).await {
            Ok(token) => {
                self.metrics.matrix_forwarded();
                debug!(
                    "matrix message forwarded to viber event_id={:?} receiver={} token={:?}",
                    event.event_id, receiver, token
                );
            }
            Err(err) => {
                self.metrics.matrix_forward_failed();
                warn!(
                    "matrix message forward failed event_id={:?} receiver={}: {err}",
                    event.event_id, receiver
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::NamedTempFile;

    use super::*;
    use crate::bridge::capabilities::{FetchedMedia, MediaKind, SendError};
    use crate::config::{CacheConfig, DatabaseConfig};

    const BOT: &str = "@bot:example.org";
    const ROOM: &str = "!room:example.org";
    const HOMESERVER: &str = "https://hs.example.org/";

    #[derive(Default)]
    struct FakeViber {
        sent: Mutex<Vec<(String, OutboundContent)>>,
        fail: bool,
    }

    #[async_trait]
    impl ViberSender for FakeViber {
        async fn send(
            &self,
            receiver: &str,
            content: OutboundContent,
        ) -> Result<Option<String>, SendError> {
            if self.fail {
                return Err(SendError::Transport("down".to_string()));
            }
            self.sent.lock().push((receiver.to_string(), content));
            Ok(Some("1".to_string()))
        }
    }

    fn sent_text(receiver: &str, text: &str) -> (String, OutboundContent) {
        (receiver.to_string(), OutboundContent::Text(text.to_string()))
    }

    #[derive(Default)]
    struct FakeRooms {
        replies: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl RoomSender for FakeRooms {
        async fn send_text(&self, room_id: &str, text: &str) -> Result<String, SendError> {
            self.replies.lock().push((room_id.to_string(), text.to_string()));
            Ok("$reply".to_string())
        }

        async fn send_media(
            &self,
            _room_id: &str,
            _kind: MediaKind,
            _media: FetchedMedia,
        ) -> Result<String, SendError> {
            Err(SendError::Rejected("media replies are not used".to_string()))
        }
    }

    struct Fixture {
        processor: MatrixEventProcessor,
        db: DatabaseManager,
        viber: Arc<FakeViber>,
        rooms: Arc<FakeRooms>,
        metrics: Arc<BridgeMetrics>,
        _file: NamedTempFile,
    }

    async fn fixture(viber: FakeViber, default_route: DefaultRoute) -> Fixture {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = DatabaseConfig {
            filename: file.path().to_string_lossy().to_string(),
            ..DatabaseConfig::default()
        };
        let db = DatabaseManager::new(&config, &CacheConfig::default())
            .await
            .expect("db manager");
        db.migrate().await.expect("migrate");

        let viber = Arc::new(viber);
        let rooms = Arc::new(FakeRooms::default());
        let metrics = Arc::new(BridgeMetrics::new());
        let commands = CommandHandler::new(db.clone(), Vec::new(), Arc::new(AtomicBool::new(false)));
        let processor = MatrixEventProcessor::new(
            BOT,
            Url::parse(HOMESERVER).expect("homeserver url"),
            db.clone(),
            viber.clone(),
            rooms.clone(),
            commands,
            default_route,
            metrics.clone(),
        );
        Fixture {
            processor,
            db,
            viber,
            rooms,
            metrics,
            _file: file,
        }
    }

    fn message(sender: &str, content: serde_json::Value, ts: Option<i64>) -> MatrixEvent {
        MatrixEvent {
            event_id: Some("$event".to_string()),
            event_type: "m.room.message".to_string(),
            room_id: ROOM.to_string(),
            sender: sender.to_string(),
            content,
            timestamp: ts,
        }
    }

    fn text(sender: &str, body: &str) -> MatrixEvent {
        message(
            sender,
            json!({"msgtype": "m.text", "body": body}),
            Some(chrono::Utc::now().timestamp_millis()),
        )
    }

    #[test]
    fn check_event_age_allows_recent_events() {
        let now = chrono::Utc::now().timestamp_millis();
        assert!(MatrixEventProcessor::check_event_age(&message("@a:x", json!({}), Some(now))));
    }

    #[test]
    fn check_event_age_rejects_old_events() {
        let old_ts = chrono::Utc::now().timestamp_millis() - 1_000_000;
        assert!(!MatrixEventProcessor::check_event_age(&message("@a:x", json!({}), Some(old_ts))));
    }

    #[test]
    fn check_event_age_allows_events_without_timestamp() {
        assert!(MatrixEventProcessor::check_event_age(&message("@a:x", json!({}), None)));
    }

    #[test]
    fn check_event_age_allows_future_events() {
        let future_ts = chrono::Utc::now().timestamp_millis() + 60_000;
        assert!(MatrixEventProcessor::check_event_age(&message("@a:x", json!({}), Some(future_ts))));
    }

    #[tokio::test]
    async fn mapped_room_is_forwarded_to_viber() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor
            .process_event(message(
                "@alice:example.org",
                json!({
                    "msgtype": "m.text",
                    "body": "> <@bob:example.org> old\n\nhello",
                }),
                None,
            ))
            .await
            .expect("process");

        assert_eq!(f.viber.sent.lock().as_slice(), &[sent_text("chat-1", "hello")]);
        assert_eq!(f.metrics.snapshot().matrix_forwarded, 1);
    }

    #[tokio::test]
    async fn own_and_non_message_events_are_skipped() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor.process_event(text(BOT, "echo")).await.expect("own");
        let mut member = text("@alice:example.org", "joined");
        member.event_type = "m.room.member".to_string();
        f.processor.process_event(member).await.expect("member");
        let stale = message(
            "@alice:example.org",
            json!({"msgtype": "m.text", "body": "old"}),
            Some(chrono::Utc::now().timestamp_millis() - 2 * AGE_LIMIT_MS),
        );
        f.processor.process_event(stale).await.expect("stale");

        assert!(f.viber.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn default_room_uses_default_receiver() {
        let route = DefaultRoute {
            room_id: Some(ROOM.to_string()),
            receiver_id: Some("fallback".to_string()),
        };
        let f = fixture(FakeViber::default(), route).await;

        f.processor
            .process_event(text("@alice:example.org", "hello"))
            .await
            .expect("process");

        assert_eq!(f.viber.sent.lock().as_slice(), &[sent_text("fallback", "hello")]);
    }

    #[tokio::test]
    async fn media_is_sent_as_native_viber_messages() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        let events = [
            json!({"msgtype": "m.image", "body": "cat.png", "url": "mxc://example.org/img"}),
            json!({
                "msgtype": "m.video",
                "body": "clip.mp4",
                "url": "mxc://example.org/vid",
                "info": {"size": 4096, "mimetype": "video/mp4"},
            }),
            json!({
                "msgtype": "m.file",
                "body": "see attached",
                "filename": "report.pdf",
                "url": "mxc://example.org/doc",
                "info": {"size": 12},
            }),
            json!({"msgtype": "m.audio", "body": "voice.ogg", "url": "mxc://example.org/aud"}),
        ];
        for content in events {
            f.processor
                .process_event(message("@alice:example.org", content, None))
                .await
                .expect("process");
        }

        let download = |id: &str| format!("{HOMESERVER}_matrix/media/v3/download/example.org/{id}");
        let sent: Vec<OutboundContent> = f.viber.sent.lock().iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(
            sent,
            vec![
                OutboundContent::Picture {
                    url: download("img"),
                    caption: "cat.png".to_string(),
                },
                OutboundContent::Video {
                    url: download("vid"),
                    size: 4096,
                },
                OutboundContent::File {
                    url: download("doc"),
                    file_name: "report.pdf".to_string(),
                    size: 12,
                },
                OutboundContent::File {
                    url: download("aud"),
                    file_name: "voice.ogg".to_string(),
                    size: 0,
                },
            ]
        );
        assert_eq!(f.metrics.snapshot().matrix_forwarded, 4);
    }

    #[tokio::test]
    async fn location_is_sent_as_coordinates() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor
            .process_event(message(
                "@alice:example.org",
                json!({"msgtype": "m.location", "body": "Big Ben", "geo_uri": "geo:51.5008,0.1247;u=35"}),
                None,
            ))
            .await
            .expect("process");
        f.processor
            .process_event(message(
                "@alice:example.org",
                json!({"msgtype": "m.location", "body": "Nowhere", "geo_uri": "not-a-geo-uri"}),
                None,
            ))
            .await
            .expect("process");

        assert_eq!(
            f.viber.sent.lock().as_slice(),
            &[
                (
                    "chat-1".to_string(),
                    OutboundContent::Location {
                        lat: 51.5008,
                        lon: 0.1247,
                    }
                ),
                sent_text("chat-1", "[Location: Nowhere]"),
            ]
        );
    }

    #[tokio::test]
    async fn media_without_mxc_url_falls_back_to_text() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor
            .process_event(message(
                "@alice:example.org",
                json!({"msgtype": "m.image", "body": "cat.png", "url": "https://elsewhere/cat.png"}),
                None,
            ))
            .await
            .expect("process");

        assert_eq!(f.viber.sent.lock().as_slice(), &[sent_text("chat-1", "[Image: cat.png]")]);
    }

    #[tokio::test]
    async fn events_relayed_from_viber_are_not_echoed() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");
        f.db.message_store()
            .store_message_mapping("555", "$event", "chat-1")
            .await
            .expect("message mapping");

        f.processor
            .process_event(text("@alice:example.org", "hello"))
            .await
            .expect("process");

        assert!(f.viber.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn unmapped_room_is_dropped() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.processor
            .process_event(text("@alice:example.org", "hello"))
            .await
            .expect("process");
        assert!(f.viber.sent.lock().is_empty());
        assert_eq!(f.metrics.snapshot().matrix_forwarded, 0);
    }

    #[tokio::test]
    async fn commands_are_answered_in_room() {
        let f = fixture(FakeViber::default(), DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor
            .process_event(text("@alice:example.org", "!bridge ping"))
            .await
            .expect("process");

        assert_eq!(
            f.rooms.replies.lock().as_slice(),
            &[(ROOM.to_string(), "pong".to_string())]
        );
        assert!(f.viber.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn viber_failure_is_counted() {
        let viber = FakeViber {
            fail: true,
            ..FakeViber::default()
        };
        let f = fixture(viber, DefaultRoute::default()).await;
        f.db.room_store()
            .create_room_mapping("chat-1", ROOM)
            .await
            .expect("mapping");

        f.processor
            .process_event(text("@alice:example.org", "hello"))
            .await
            .expect("failure is not fatal");

        let snapshot = f.metrics.snapshot();
        assert_eq!(snapshot.matrix_forward_failures, 1);
        assert_eq!(snapshot.matrix_forwarded, 0);
    }
}
