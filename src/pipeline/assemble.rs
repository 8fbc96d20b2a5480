//! Assembler: turn ordered pages into a verified document, with retry.
//!
//! Encoding is CPU-bound, so each attempt runs on tokio's blocking pool via
//! `spawn_blocking` and is raced against the per-attempt timeout. A timed-out
//! attempt is abandoned: its eventual output is dropped, never reused. The
//! blocking pool cannot interrupt an encoder, so every abandoned attempt is
//! awaited before [`Assembler::assemble_with_retry`] returns.
//!
//! Verification is part of the attempt. A document that fails
//! [`crate::pipeline::verify::verify`] is discarded and the attempt counts
//! against the same budget as an encoder error or a timeout.

use crate::config::PageSize;
use crate::error::AssemblyError;
use crate::model::{ChapterMetadata, Document, NormalizedPage};
use crate::pipeline::verify::verify;
use crate::progress::{emit, BatchState, ProgressEvent, SharedProgress};
use crate::retry::{retry, RetryError, RetryHint, RetryPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl RetryHint for AssemblyError {}

/// Serialises pages plus metadata into document bytes.
///
/// Implementations must be deterministic for identical input and must not
/// reorder `pages`; ordering is the assembler's job.
pub trait DocumentEncoder: Send + Sync {
    fn encode(
        &self,
        pages: &[NormalizedPage],
        metadata: &ChapterMetadata,
        page_size: PageSize,
    ) -> Result<Vec<u8>, AssemblyError>;
}

/// One synchronous assembly: order `pages` by sequence index and encode.
pub fn assemble(
    encoder: &dyn DocumentEncoder,
    pages: &[NormalizedPage],
    metadata: &ChapterMetadata,
    page_size: PageSize,
) -> Result<Document, AssemblyError> {
    // Encoders take a contiguous slice; only clone when input arrived out of order.
    let sorted;
    let ordered: &[NormalizedPage] = if pages.windows(2).all(|w| w[0].index < w[1].index) {
        pages
    } else {
        let mut owned = pages.to_vec();
        owned.sort_by_key(|p| p.index);
        sorted = owned;
        &sorted
    };

    let bytes = encoder.encode(ordered, metadata, page_size)?;
    Ok(Document {
        bytes,
        page_indices: ordered.iter().map(|p| p.index).collect(),
        metadata: metadata.clone(),
    })
}

/// A verified document and the retries it took.
#[derive(Debug)]
pub struct Assembled {
    pub document: Document,
    pub attempts: u32,
}

impl Assembled {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Failure of the whole assembly loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyFailure {
    pub attempts: u32,
    pub error: AssemblyError,
}

/// Retrying, timeout-bounded front end to a [`DocumentEncoder`].
#[derive(Clone)]
pub struct Assembler {
    encoder: Arc<dyn DocumentEncoder>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
    page_size: PageSize,
}

impl Assembler {
    pub fn new(
        encoder: Arc<dyn DocumentEncoder>,
        policy: RetryPolicy,
        attempt_timeout: Duration,
        page_size: PageSize,
    ) -> Self {
        Self {
            encoder,
            policy,
            attempt_timeout,
            page_size,
        }
    }

    /// Assemble and verify, retrying failed attempts per the policy.
    pub async fn assemble_with_retry(
        &self,
        pages: Vec<NormalizedPage>,
        metadata: &ChapterMetadata,
        cancel: &CancellationToken,
        progress: Option<&SharedProgress>,
    ) -> Result<Assembled, AssemblyFailure> {
        let pages: Arc<[NormalizedPage]> = pages.into();
        let metadata = Arc::new(metadata.clone());
        let max_attempts = self.policy.max_attempts() as usize;
        // Each encoder job holds a sender; `recv` yields `None` once all are gone.
        let (running_tx, mut running_rx) = mpsc::channel::<()>(1);
        let abandoned = AtomicU32::new(0);

        let outcome = retry("assembly", &self.policy, cancel, |attempt| {
            let running = running_tx.clone();
            let abandoned = &abandoned;
            let encoder = Arc::clone(&self.encoder);
            let pages = Arc::clone(&pages);
            let metadata = Arc::clone(&metadata);
            let page_size = self.page_size;
            let timeout = self.attempt_timeout;
            async move {
                emit(
                    progress,
                    ProgressEvent::new(BatchState::Assembling, attempt as usize - 1, max_attempts)
                        .with_message(format!("{} page(s), attempt {attempt}", pages.len())),
                );
                let job = tokio::task::spawn_blocking(move || {
                    let _running = running;
                    assemble(encoder.as_ref(), &pages, &metadata, page_size)
                });
                let document = match tokio::time::timeout(timeout, job).await {
                    Err(_) => {
                        abandoned.fetch_add(1, Ordering::SeqCst);
                        return Err(AssemblyError::Timeout {
                            ms: timeout.as_millis() as u64,
                        })
                    }
                    Ok(Err(join_err)) => {
                        return Err(AssemblyError::EncodingFailure(format!(
                            "encoder task failed: {join_err}"
                        )))
                    }
                    Ok(Ok(result)) => result?,
                };

                emit(
                    progress,
                    ProgressEvent::new(BatchState::Verifying, attempt as usize - 1, max_attempts),
                );
                if let Err(e) = verify(&document.bytes) {
                    warn!("Assembly attempt {}: discarding malformed output: {}", attempt, e);
                    return Err(AssemblyError::from(e));
                }
                debug!(
                    "Assembly attempt {}: {} bytes verified",
                    attempt,
                    document.bytes.len()
                );
                Ok(document)
            }
        })
        .await;

        drop(running_tx);
        let stalled = abandoned.load(Ordering::SeqCst);
        if stalled > 0 {
            debug!("Assembly: waiting for {} abandoned encoder attempt(s)", stalled);
        }
        let _ = running_rx.recv().await;

        match outcome {
            Ok(done) => {
                info!(
                    "Assembled {} page(s) after {} attempt(s)",
                    done.value.page_count(),
                    done.attempts
                );
                Ok(Assembled {
                    document: done.value,
                    attempts: done.attempts,
                })
            }
            Err(RetryError::Exhausted { attempts, last }) => Err(AssemblyFailure {
                attempts,
                error: last,
            }),
            Err(RetryError::Cancelled { attempts }) => Err(AssemblyFailure {
                attempts,
                error: AssemblyError::Cancelled,
            }),
        }
    }
}
