use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bridge::capabilities::{FetchedMedia, MediaKind, RoomCreator, RoomSender, SendError};
use crate::config::MatrixConfig;

pub mod event_handler;

pub use self::event_handler::{DefaultRoute, MatrixEventProcessor};

const INITIAL_SYNC_RETRY_SECONDS: u64 = 2;
const MAX_SYNC_RETRY_SECONDS: u64 = 300;

#[derive(Debug, Error)]
pub enum MatrixError {
    #[error("matrix request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("matrix returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid matrix url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid matrix response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<MatrixError> for SendError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::Status { status, body } if (400..500).contains(&status) && status != 429 => {
                SendError::Rejected(format!("http {status}: {body}"))
            }
            other => SendError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatrixEvent {
    pub event_id: Option<String>,
    pub event_type: String,
    pub room_id: String,
    pub sender: String,
    pub content: Value,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct SyncRooms {
    #[serde(default)]
    join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Deserialize)]
struct JoinedRoom {
    #[serde(default)]
    timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    sender: String,
    #[serde(default)]
    origin_server_ts: Option<i64>,
    #[serde(default)]
    content: Value,
}

impl SyncResponse {
    /// Timeline events of every joined room.
    pub fn into_events(self) -> Vec<MatrixEvent> {
        self.rooms
            .join
            .into_iter()
            .flat_map(|(room_id, room)| {
                room.timeline.events.into_iter().map(move |event| MatrixEvent {
                    event_id: event.event_id,
                    event_type: event.event_type,
                    room_id: room_id.clone(),
                    sender: event.sender,
                    content: event.content,
                    timestamp: event.origin_server_ts,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct WhoAmIResponse {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

fn encode_path(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}

/// Public download URL for an `mxc://server/media_id` URI, so a remote
/// service can fetch the file without a Matrix token.
pub fn media_download_url(homeserver: &Url, mxc: &str) -> Option<String> {
    let (server, media_id) = mxc.strip_prefix("mxc://")?.split_once('/')?;
    if server.is_empty() || media_id.is_empty() || media_id.contains('/') {
        return None;
    }
    homeserver
        .join(&format!(
            "_matrix/media/v3/download/{}/{}",
            encode_path(server),
            encode_path(media_id)
        ))
        .ok()
        .map(String::from)
}

/// Client-server API client authenticated with a bot access token.
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver: Url,
    token: SecretString,
    invite_users: Vec<String>,
    sync_timeout_ms: u64,
    http_timeout: Duration,
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig, http_timeout: Duration) -> Result<Self, MatrixError> {
        let mut homeserver = Url::parse(&config.homeserver_url)?;
        if !homeserver.path().ends_with('/') {
            let path = format!("{}/", homeserver.path());
            homeserver.set_path(&path);
        }
        Ok(Self {
            http: reqwest::Client::builder().timeout(http_timeout).build()?,
            homeserver,
            token: SecretString::from(config.access_token.clone()),
            invite_users: config.invite_users.clone(),
            sync_timeout_ms: config.sync_timeout_ms,
            http_timeout,
        })
    }

    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    fn endpoint(&self, path: &str) -> Result<Url, MatrixError> {
        Ok(self.homeserver.join(path)?)
    }

    async fn execute<R: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<R, MatrixError> {
        let response = request.bearer_auth(self.token.expose_secret()).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(MatrixError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(256).collect(),
            });
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn whoami(&self) -> Result<String, MatrixError> {
        let url = self.endpoint("_matrix/client/v3/account/whoami")?;
        let who: WhoAmIResponse = self.execute(self.http.get(url)).await?;
        Ok(who.user_id)
    }

    pub async fn send_message_content(
        &self,
        room_id: &str,
        content: &Value,
    ) -> Result<String, MatrixError> {
        let txn_id = uuid::Uuid::new_v4().simple().to_string();
        let url = self.endpoint(&format!(
            "_matrix/client/v3/rooms/{}/send/m.room.message/{}",
            encode_path(room_id),
            txn_id
        ))?;
        let sent: EventIdResponse = self.execute(self.http.put(url).json(content)).await?;
        Ok(sent.event_id)
    }

    /// Uploads to the media repository and returns the `mxc://` URI.
    pub async fn upload(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        file_name: &str,
    ) -> Result<String, MatrixError> {
        let mut url = self.endpoint("_matrix/media/v3/upload")?;
        url.query_pairs_mut().append_pair("filename", file_name);
        let uploaded: UploadResponse = self
            .execute(
                self.http
                    .post(url)
                    .header(reqwest::header::CONTENT_TYPE, content_type)
                    .body(bytes),
            )
            .await?;
        Ok(uploaded.content_uri)
    }

    pub async fn create_portal_room(&self, name: &str, topic: &str) -> Result<String, MatrixError> {
        let url = self.endpoint("_matrix/client/v3/createRoom")?;
        let body = json!({
            "name": name,
            "topic": topic,
            "preset": "private_chat",
            "invite": self.invite_users,
        });
        let created: RoomIdResponse = self.execute(self.http.post(url).json(&body)).await?;
        info!("matrix room created room_id={} name={}", created.room_id, name);
        Ok(created.room_id)
    }

    /// One `/sync` call. Without `since` the timeline is skipped so startup
    /// does not replay history.
    pub async fn sync(&self, since: Option<&str>) -> Result<SyncResponse, MatrixError> {
        let mut url = self.endpoint("_matrix/client/v3/sync")?;
        let timeout_ms = match since {
            Some(since) => {
                url.query_pairs_mut()
                    .append_pair("since", since)
                    .append_pair("timeout", &self.sync_timeout_ms.to_string());
                self.sync_timeout_ms
            }
            None => {
                url.query_pairs_mut()
                    .append_pair("timeout", "0")
                    .append_pair("filter", r#"{"room":{"timeline":{"limit":0}}}"#);
                0
            }
        };
        let request = self
            .http
            .get(url)
            .timeout(Duration::from_millis(timeout_ms) + self.http_timeout);
        self.execute(request).await
    }
}

#[async_trait]
impl RoomSender for MatrixClient {
    async fn send_text(&self, room_id: &str, text: &str) -> Result<String, SendError> {
        let content = json!({ "msgtype": "m.text", "body": text });
        Ok(self.send_message_content(room_id, &content).await?)
    }

    async fn send_media(
        &self,
        room_id: &str,
        kind: MediaKind,
        media: FetchedMedia,
    ) -> Result<String, SendError> {
        let size = media.bytes.len();
        let content_uri = self
            .upload(media.bytes, &media.content_type, &media.file_name)
            .await?;
        let content = json!({
            "msgtype": kind.msgtype(),
            "body": media.file_name,
            "url": content_uri,
            "info": {
                "mimetype": media.content_type,
                "size": size,
            }
        });
        Ok(self.send_message_content(room_id, &content).await?)
    }
}

#[async_trait]
impl RoomCreator for MatrixClient {
    async fn create_room(&self, name: &str, topic: &str) -> Result<String, SendError> {
        Ok(self.create_portal_room(name, topic).await?)
    }
}

/// Long-polls `/sync` until `shutdown` flips, feeding timeline events to the
/// processor. Failures back off exponentially and never end the loop.
pub async fn run_sync_loop(
    client: Arc<MatrixClient>,
    processor: Arc<MatrixEventProcessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut since: Option<String> = None;
    let mut retry_seconds = INITIAL_SYNC_RETRY_SECONDS;

    while !*shutdown.borrow() {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = client.sync(since.as_deref()) => result,
        };

        match result {
            Ok(response) => {
                retry_seconds = INITIAL_SYNC_RETRY_SECONDS;
                let next_batch = response.next_batch.clone();
                if since.is_none() {
                    info!("matrix initial sync complete, history skipped");
                } else {
                    for event in response.into_events() {
                        let event_id = event.event_id.clone();
                        if let Err(err) = processor.process_event(event).await {
                            error!("matrix event processing failed event_id={event_id:?}: {err}");
                        }
                    }
                }
                since = Some(next_batch);
            }
            Err(err) => {
                warn!("matrix sync failed retry_in={retry_seconds}s: {err}");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(Duration::from_secs(retry_seconds)) => {}
                }
                retry_seconds = (retry_seconds * 2).min(MAX_SYNC_RETRY_SECONDS);
            }
        }
    }
    debug!("matrix sync loop stopped");
}
