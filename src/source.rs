//! Where image bytes and image lists come from.
//!
//! The pipeline never talks to an API directly. It asks a [`ContentSource`]
//! for bytes and, optionally, a [`ChapterLocator`] for the list of page URLs.
//! Both are traits so tests and embedding applications can plug in their own
//! transport (authenticated clients, caches, fixtures).
//!
//! [`HttpContentSource`] is the plain reqwest-backed source.

use crate::error::SourceError;
use crate::model::ImageBytes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Fetches the raw bytes behind an image URL.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn get_image_bytes(&self, url: &str) -> Result<ImageBytes, SourceError>;
}

/// Image variant requested from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageQuality {
    /// Original uploads. (default)
    #[default]
    Data,
    /// Recompressed, smaller images.
    DataSaver,
}

impl ImageQuality {
    /// Path segment used by image servers for this variant.
    pub fn as_path(self) -> &'static str {
        match self {
            ImageQuality::Data => "data",
            ImageQuality::DataSaver => "data-saver",
        }
    }
}

impl std::str::FromStr for ImageQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data" => Ok(ImageQuality::Data),
            "data-saver" | "datasaver" | "data_saver" => Ok(ImageQuality::DataSaver),
            other => Err(format!("unknown image quality '{other}'")),
        }
    }
}

/// Resolves a chapter id to its ordered page URLs.
#[async_trait]
pub trait ChapterLocator: Send + Sync {
    async fn get_image_urls(
        &self,
        chapter_id: &str,
        quality: ImageQuality,
    ) -> Result<Vec<String>, SourceError>;
}

/// Plain HTTP(S) source backed by a shared [`reqwest::Client`].
///
/// The client carries no timeout of its own: the fetch stage bounds every
/// attempt, so a second, competing timeout would only blur the error kind.
#[derive(Debug, Clone)]
pub struct HttpContentSource {
    client: reqwest::Client,
}

impl HttpContentSource {
    /// Build a source with a connect timeout and a descriptive user agent.
    pub fn new() -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wrap an existing client (auth headers, proxies, …).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn get_image_bytes(&self, url: &str) -> Result<ImageBytes, SourceError> {
        let response = self.client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                401 | 403 => SourceError::Unauthorized {
                    status: status.as_u16(),
                },
                429 => SourceError::RateLimited {
                    retry_after_secs: response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after),
                },
                code => SourceError::Status { status: code },
            });
        }

        let declared_len = response.content_length();
        let bytes = response.bytes().await.map_err(classify)?;
        debug!("GET {} → {} bytes", url, bytes.len());

        Ok(ImageBytes {
            data: bytes.to_vec(),
            declared_len,
        })
    }
}

fn classify(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Network(e.to_string())
    }
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}
