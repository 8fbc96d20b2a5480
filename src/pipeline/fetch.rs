//! Fetcher: download one image with bounded, cancellable retry.
//!
//! Every attempt is wrapped in its own timeout. Network failures, timeouts
//! and non-success statuses all count as failed attempts; the shared
//! [`crate::retry::retry`] loop applies the backoff and watches the
//! cancellation token between attempts.

use crate::error::{FetchError, FetchErrorKind, SourceError};
use crate::model::RawImage;
use crate::progress::{emit, BatchState, ProgressEvent, SharedProgress};
use crate::retry::{retry, RetryError, RetryHint, RetryPolicy};
use crate::source::ContentSource;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl RetryHint for SourceError {
    fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Everything a fetch needs besides the URL itself.
pub struct FetchContext<'a> {
    pub source: &'a dyn ContentSource,
    pub policy: &'a RetryPolicy,
    pub attempt_timeout: Duration,
    pub cancel: &'a CancellationToken,
    pub progress: Option<&'a SharedProgress>,
    /// Number of images in the batch, for progress events.
    pub total: usize,
    /// Images of the batch downloaded so far; bumped on every success.
    pub fetched: &'a AtomicUsize,
}

/// A successful download.
#[derive(Debug)]
pub struct Fetched {
    pub raw: RawImage,
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Check that `url` is a non-empty absolute HTTP(S) URL.
pub fn is_valid_url(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.has_host(),
        Err(_) => false,
    }
}

/// Download the image at `url` (sequence position `index`).
pub async fn fetch(ctx: &FetchContext<'_>, index: usize, url: &str) -> Result<Fetched, FetchError> {
    if !is_valid_url(url) {
        return Err(FetchError {
            url: url.to_string(),
            attempts: 0,
            kind: FetchErrorKind::Network(format!("malformed URL '{url}'")),
        });
    }

    let label = format!("page {index}");
    let outcome = retry(&label, ctx.policy, ctx.cancel, |attempt| async move {
        emit(
            ctx.progress,
            ProgressEvent::new(
                BatchState::Fetching,
                ctx.fetched.load(Ordering::SeqCst),
                ctx.total,
            )
            .with_message(format!("page {index}: attempt {attempt}")),
        );
        match tokio::time::timeout(ctx.attempt_timeout, ctx.source.get_image_bytes(url)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout),
        }
    })
    .await;

    match outcome {
        Ok(done) => {
            ctx.fetched.fetch_add(1, Ordering::SeqCst);
            debug!(
                "Page {}: fetched {} bytes in {} attempt(s)",
                index,
                done.value.data.len(),
                done.attempts
            );
            Ok(Fetched {
                raw: RawImage::new(index, done.value),
                attempts: done.attempts,
            })
        }
        Err(RetryError::Exhausted { attempts, last }) => Err(FetchError {
            url: url.to_string(),
            attempts,
            kind: FetchErrorKind::from(&last),
        }),
        Err(RetryError::Cancelled { attempts }) => Err(FetchError {
            url: url.to_string(),
            attempts,
            kind: FetchErrorKind::Cancelled,
        }),
    }
}
