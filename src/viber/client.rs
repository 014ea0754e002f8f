use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::bridge::capabilities::{OutboundContent, SendError, ViberSender};
use crate::config::ViberConfig;
use crate::utils::circuit_breaker::CircuitBreaker;
use crate::utils::retry::{RetryPolicy, retry_if};

pub const AUTH_HEADER: &str = "X-Viber-Auth-Token";
const MIN_API_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ViberApiError {
    #[error("viber request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("viber returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("viber api error {status}: {message}")]
    Api { status: i64, message: String },
    #[error("invalid viber response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid viber url: {0}")]
    Url(#[from] url::ParseError),
    #[error("viber circuit breaker is open")]
    CircuitOpen,
}

impl ViberApiError {
    /// Transport failures, throttling and server errors may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            ViberApiError::Http(_) => true,
            ViberApiError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<ViberApiError> for SendError {
    fn from(err: ViberApiError) -> Self {
        match err {
            ViberApiError::CircuitOpen => SendError::CircuitOpen,
            ViberApiError::Api { status, message } => {
                SendError::Rejected(format!("status {status}: {message}"))
            }
            other => SendError::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Text {
        text: String,
    },
    Picture {
        text: String,
        media: String,
    },
    Video {
        media: String,
        size: u64,
    },
    File {
        media: String,
        size: u64,
        file_name: String,
    },
    Location {
        location: Location,
    },
}

impl From<OutboundContent> for OutboundMessage {
    fn from(content: OutboundContent) -> Self {
        match content {
            OutboundContent::Text(text) => OutboundMessage::Text { text },
            OutboundContent::Picture { url, caption } => OutboundMessage::Picture {
                text: caption,
                media: url,
            },
            OutboundContent::Video { url, size } => OutboundMessage::Video { media: url, size },
            OutboundContent::File {
                url,
                file_name,
                size,
            } => OutboundMessage::File {
                media: url,
                size,
                file_name,
            },
            OutboundContent::Location { lat, lon } => OutboundMessage::Location {
                location: Location { lat, lon },
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SendMessageRequest {
    pub receiver: String,
    pub min_api_version: u32,
    pub sender: SenderInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_data: Option<String>,
    #[serde(flatten)]
    pub message: OutboundMessage,
}

/// Decoded after `parse_reply` has checked the status.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default, deserialize_with = "super::payload::deserialize_token")]
    pub message_token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct SetWebhookRequest<'a> {
    url: &'a str,
    event_types: &'a [String],
    send_name: bool,
    send_photo: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetWebhookResponse {
    #[serde(default)]
    pub event_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    status: i64,
    #[serde(default)]
    status_message: String,
}

/// Checks the vendor `status` field before decoding the typed reply.
fn parse_reply<R: DeserializeOwned>(bytes: &[u8]) -> Result<R, ViberApiError> {
    let status: ApiStatus = serde_json::from_slice(bytes)?;
    if status.status != 0 {
        return Err(ViberApiError::Api {
            status: status.status,
            message: status.status_message,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}

pub struct ViberClient {
    http: reqwest::Client,
    base_url: Url,
    token: SecretString,
    sender: SenderInfo,
    breaker: CircuitBreaker,
}

impl ViberClient {
    pub fn new(config: &ViberConfig) -> Result<Self, ViberApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(&config.api_base_url)?,
            token: SecretString::from(config.api_token.clone()),
            sender: SenderInfo {
                name: config.sender_name.clone(),
                avatar: config.sender_avatar.clone(),
            },
            breaker: CircuitBreaker::new("viber", 5, 1, Duration::from_secs(30)),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ViberApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ViberApiError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .post(url)
            .header(AUTH_HEADER, self.token.expose_secret())
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let bytes = response.bytes().await?;
        if status != StatusCode::OK {
            return Err(ViberApiError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).chars().take(256).collect(),
            });
        }
        parse_reply(&bytes)
    }

    pub async fn send_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<SendMessageResponse, ViberApiError> {
        if !self.breaker.allow() {
            return Err(ViberApiError::CircuitOpen);
        }

        let result = self.post("/pa/send_message", request).await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(err) if err.is_transient() => self.breaker.record_failure(),
            // the service answered, the breaker only tracks reachability
            Err(_) => self.breaker.record_success(),
        }
        result
    }

    pub async fn send(
        &self,
        receiver: &str,
        message: OutboundMessage,
    ) -> Result<SendMessageResponse, ViberApiError> {
        let request = SendMessageRequest {
            receiver: receiver.to_string(),
            min_api_version: MIN_API_VERSION,
            sender: self.sender.clone(),
            tracking_data: None,
            message,
        };
        let response = self.send_message(&request).await?;
        debug!(
            "viber message sent receiver={} token={:?}",
            receiver, response.message_token
        );
        Ok(response)
    }

    pub async fn set_webhook(
        &self,
        url: &str,
        event_types: &[String],
    ) -> Result<SetWebhookResponse, ViberApiError> {
        let request = SetWebhookRequest {
            url,
            event_types,
            send_name: true,
            send_photo: true,
        };
        self.post("/pa/set_webhook", &request).await
    }
}

#[async_trait]
impl ViberSender for ViberClient {
    async fn send(
        &self,
        receiver: &str,
        content: OutboundContent,
    ) -> Result<Option<String>, SendError> {
        ViberClient::send(self, receiver, content.into())
            .await
            .map(|response| response.message_token)
            .map_err(SendError::from)
    }
}

/// Registers the webhook, retrying transient failures with backoff. Viber
/// calls the URL while handling the request, so the listener must be up.
pub async fn register_webhook(
    client: &ViberClient,
    url: &str,
    event_types: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<String>, ViberApiError> {
    let response = retry_if(
        policy,
        "viber set_webhook",
        ViberApiError::is_transient,
        |attempt| {
            debug!("registering viber webhook attempt={attempt} url={url}");
            client.set_webhook(url, event_types)
        },
    )
    .await
    .inspect_err(|err| warn!("viber webhook registration failed url={url}: {err}"))?;

    info!(
        "viber webhook registered url={} event_types={:?}",
        url, response.event_types
    );
    Ok(response.event_types)
}
