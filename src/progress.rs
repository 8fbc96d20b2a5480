//! Progress reporting for chapter batches.
//!
//! Inject an [`Arc<dyn ProgressSink>`] via
//! [`crate::config::PipelineConfigBuilder::progress`] to receive
//! [`ProgressEvent`]s as the pipeline moves through its stages.
//!
//! Sinks are called from worker tasks running concurrently, so they must be
//! `Send + Sync` and should return quickly: the pipeline calls them inline
//! and never waits on anything else. Any `Fn(&ProgressEvent)` closure is a
//! sink.
//!
//! # Example
//!
//! ```rust
//! use chapter_pdf::{BatchState, PipelineConfig, ProgressEvent, ProgressSink};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! let converted = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&converted);
//! let sink = move |event: &ProgressEvent| {
//!     if event.stage == BatchState::Converting {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }
//! };
//!
//! let config = PipelineConfig::builder()
//!     .progress(Arc::new(sink) as Arc<dyn ProgressSink>)
//!     .build()
//!     .unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// States of one chapter batch, also used as the stage of a progress event.
///
/// ```text
/// Pending ─▶ Fetching ─▶ Converting ─▶ Assembling ─▶ Verifying ─▶ Done
///                                                              ├─▶ PartialFailure
///                                                              ├─▶ Failed
///                         (any state) ────────────────────────└─▶ Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchState {
    Pending,
    Fetching,
    Converting,
    Assembling,
    Verifying,
    Done,
    PartialFailure,
    Failed,
    Cancelled,
}

impl BatchState {
    /// Whether the batch has reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Done
                | BatchState::PartialFailure
                | BatchState::Failed
                | BatchState::Cancelled
        )
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Pending => "pending",
            BatchState::Fetching => "fetching",
            BatchState::Converting => "converting",
            BatchState::Assembling => "assembling",
            BatchState::Verifying => "verifying",
            BatchState::Done => "done",
            BatchState::PartialFailure => "partial-failure",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One progress notification. Emitted, never retained by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: BatchState,
    /// Units finished in this stage (pages for fetch/convert, attempts for assembly).
    pub completed: usize,
    pub total: usize,
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn new(stage: BatchState, completed: usize, total: usize) -> Self {
        Self {
            stage,
            completed,
            total,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Receives progress events from the pipeline.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn report(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// A sink that drops every event.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type SharedProgress = Arc<dyn ProgressSink>;

/// Send `event` to `sink` when one is configured.
pub(crate) fn emit(sink: Option<&SharedProgress>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink.report(&event);
    }
}
