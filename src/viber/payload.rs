use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid webhook json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("webhook is missing {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ViberUserInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl ViberUserInfo {
    /// Viber omits the name for some accounts, fall back to the id.
    pub fn display_name(&self) -> &str {
        let name = self.name.trim();
        if name.is_empty() { self.id.as_str() } else { name }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViberEvent {
    Message(InboundMessage),
    Subscribed { user: ViberUserInfo },
    Unsubscribed { user_id: String },
    ConversationStarted { user: ViberUserInfo, subscribed: bool },
    /// Delivery receipts, the `webhook` callback check and anything newer than this
    /// decoder. Acknowledged without further work.
    Unknown { event: String },
}

impl ViberEvent {
    pub fn kind(&self) -> &str {
        match self {
            ViberEvent::Message(_) => "message",
            ViberEvent::Subscribed { .. } => "subscribed",
            ViberEvent::Unsubscribed { .. } => "unsubscribed",
            ViberEvent::ConversationStarted { .. } => "conversation_started",
            ViberEvent::Unknown { event } => event,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message_token: Option<String>,
    pub sender: ViberUserInfo,
    /// `message.chat_id` for group chats, otherwise the sender id.
    pub chat_id: String,
    pub is_group: bool,
    pub timestamp: Option<i64>,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text {
        text: String,
    },
    Picture {
        media: String,
        caption: Option<String>,
        file_name: Option<String>,
    },
    Video {
        media: String,
        caption: Option<String>,
        size: Option<u64>,
    },
    File {
        media: String,
        file_name: Option<String>,
        size: Option<u64>,
    },
    Location {
        lat: f64,
        lon: f64,
    },
    Contact {
        name: String,
        phone: String,
    },
    Sticker {
        media: Option<String>,
        sticker_id: Option<i64>,
    },
    Unknown {
        kind: String,
    },
}

impl MessageContent {
    pub fn kind(&self) -> &str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Picture { .. } => "picture",
            MessageContent::Video { .. } => "video",
            MessageContent::File { .. } => "file",
            MessageContent::Location { .. } => "location",
            MessageContent::Contact { .. } => "contact",
            MessageContent::Sticker { .. } => "sticker",
            MessageContent::Unknown { kind } => kind,
        }
    }
}

/// Accepts a message token sent either as a JSON number or a string.
pub(crate) fn deserialize_token<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Unsigned(u64),
        Signed(i64),
        Text(String),
    }

    Ok(match Option::<Token>::deserialize(deserializer)? {
        Some(Token::Unsigned(value)) => Some(value.to_string()),
        Some(Token::Signed(value)) => Some(value.to_string()),
        Some(Token::Text(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    event: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_token")]
    message_token: Option<String>,
    #[serde(default)]
    sender: Option<ViberUserInfo>,
    #[serde(default)]
    user: Option<ViberUserInfo>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    subscribed: Option<bool>,
    #[serde(default)]
    message: Option<RawMessage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    media: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    sticker_id: Option<i64>,
    #[serde(default)]
    location: Option<RawLocation>,
    #[serde(default)]
    contact: Option<RawContact>,
    #[serde(default)]
    chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawLocation {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct RawContact {
    #[serde(default)]
    name: String,
    #[serde(default)]
    phone_number: String,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Decodes a Viber callback body into a typed event.
pub fn decode(body: &[u8]) -> Result<ViberEvent, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(body)?;

    match raw.event.as_str() {
        "message" => {
            let sender = raw
                .sender
                .filter(|s| !s.id.trim().is_empty())
                .ok_or(DecodeError::MissingField("sender.id"))?;
            let message = raw.message.ok_or(DecodeError::MissingField("message"))?;
            let group_chat = non_empty(message.chat_id.clone());
            let content = decode_content(message)?;
            Ok(ViberEvent::Message(InboundMessage {
                message_token: raw.message_token,
                is_group: group_chat.is_some(),
                chat_id: group_chat.unwrap_or_else(|| sender.id.clone()),
                sender,
                timestamp: raw.timestamp,
                content,
            }))
        }
        "subscribed" => Ok(ViberEvent::Subscribed {
            user: raw.user.ok_or(DecodeError::MissingField("user"))?,
        }),
        "conversation_started" => Ok(ViberEvent::ConversationStarted {
            user: raw.user.ok_or(DecodeError::MissingField("user"))?,
            subscribed: raw.subscribed.unwrap_or(false),
        }),
        "unsubscribed" => Ok(ViberEvent::Unsubscribed {
            user_id: non_empty(raw.user_id).ok_or(DecodeError::MissingField("user_id"))?,
        }),
        other => Ok(ViberEvent::Unknown {
            event: other.to_string(),
        }),
    }
}

fn decode_content(message: RawMessage) -> Result<MessageContent, DecodeError> {
    let content = match message.kind.as_str() {
        "text" => MessageContent::Text {
            text: message.text.unwrap_or_default(),
        },
        "picture" => MessageContent::Picture {
            media: non_empty(message.media).ok_or(DecodeError::MissingField("message.media"))?,
            caption: non_empty(message.text),
            file_name: non_empty(message.file_name),
        },
        "video" => MessageContent::Video {
            media: non_empty(message.media).ok_or(DecodeError::MissingField("message.media"))?,
            caption: non_empty(message.text),
            size: message.size,
        },
        "file" => MessageContent::File {
            media: non_empty(message.media).ok_or(DecodeError::MissingField("message.media"))?,
            file_name: non_empty(message.file_name),
            size: message.size,
        },
        "location" => {
            let location = message
                .location
                .ok_or(DecodeError::MissingField("message.location"))?;
            MessageContent::Location {
                lat: location.lat,
                lon: location.lon,
            }
        }
        "contact" => {
            let contact = message
                .contact
                .ok_or(DecodeError::MissingField("message.contact"))?;
            MessageContent::Contact {
                name: contact.name,
                phone: contact.phone_number,
            }
        }
        "sticker" => MessageContent::Sticker {
            media: non_empty(message.media).or_else(|| non_empty(message.thumbnail)),
            sticker_id: message.sticker_id,
        },
        other => MessageContent::Unknown {
            kind: other.to_string(),
        },
    };
    Ok(content)
}
