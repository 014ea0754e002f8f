use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::bridge::capabilities::{FetchedMedia, MediaFetcher, SendError};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Downloads Viber media so it can be re-uploaded to Matrix.
pub struct MediaHandler {
    client: Client,
    max_bytes: usize,
}

impl MediaHandler {
    pub fn new(max_bytes: usize, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            max_bytes,
        })
    }

    fn check_size(&self, size: usize, url: &str) -> Result<(), SendError> {
        if size > self.max_bytes {
            warn!("media too large: {} bytes (max {}) url={}", size, self.max_bytes, url);
            return Err(SendError::Rejected(format!(
                "media too large: {size} bytes (max {})",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("attachment")
        .to_string()
}

fn guess_content_type(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "ogg" | "oga" => "audio/ogg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "zip" => "application/zip",
        _ => DEFAULT_CONTENT_TYPE,
    }
}

#[async_trait]
impl MediaFetcher for MediaHandler {
    async fn fetch(&self, url: &str, file_name: Option<&str>) -> Result<FetchedMedia, SendError> {
        debug!("downloading media from {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SendError::Transport(format!("failed to download {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(SendError::Transport(format!(
                "failed to download {url}: status {}",
                response.status()
            )));
        }
        if let Some(length) = response.content_length() {
            self.check_size(usize::try_from(length).unwrap_or(usize::MAX), url)?;
        }

        let file_name = file_name
            .filter(|name| !name.trim().is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| file_name_from_url(url));
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && *v != DEFAULT_CONTENT_TYPE)
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| guess_content_type(&file_name).to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| SendError::Transport(format!("failed to read media body: {e}")))?
            .to_vec();
        self.check_size(bytes.len(), url)?;

        debug!("downloaded {} bytes from {}", bytes.len(), url);
        Ok(FetchedMedia {
            bytes,
            content_type,
            file_name,
        })
    }
}
