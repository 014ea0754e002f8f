//! Narrow interfaces the relay needs from each side. Nothing here depends on
//! a concrete client, so the Matrix and Viber modules can both import it.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rejected by remote: {0}")]
    Rejected(String),
    #[error("circuit breaker open")]
    CircuitOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn msgtype(self) -> &'static str {
        match self {
            MediaKind::Image => "m.image",
            MediaKind::Video => "m.video",
            MediaKind::File => "m.file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

/// Sends into a Matrix room. Returns the new event id.
#[async_trait]
pub trait RoomSender: Send + Sync {
    async fn send_text(&self, room_id: &str, text: &str) -> Result<String, SendError>;
    async fn send_media(
        &self,
        room_id: &str,
        kind: MediaKind,
        media: FetchedMedia,
    ) -> Result<String, SendError>;
}

/// Creates a portal room and returns its id.
#[async_trait]
pub trait RoomCreator: Send + Sync {
    async fn create_room(&self, name: &str, topic: &str) -> Result<String, SendError>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str, file_name: Option<&str>) -> Result<FetchedMedia, SendError>;
}

/// What a Matrix message becomes on the Viber side. Media is referenced by
/// a URL Viber can download.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text(String),
    Picture {
        url: String,
        caption: String,
    },
    Video {
        url: String,
        size: u64,
    },
    File {
        url: String,
        file_name: String,
        size: u64,
    },
    Location {
        lat: f64,
        lon: f64,
    },
}

/// Sends to a Viber receiver. Returns the vendor message token.
#[async_trait]
pub trait ViberSender: Send + Sync {
    async fn send(
        &self,
        receiver: &str,
        content: OutboundContent,
    ) -> Result<Option<String>, SendError>;
}

/// Both Matrix capabilities, as provided by the Matrix client.
pub trait MatrixPort: RoomSender + RoomCreator {}

impl<T: RoomSender + RoomCreator> MatrixPort for T {}
