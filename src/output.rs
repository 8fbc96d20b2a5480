//! Result types returned by the chapter pipeline.

use crate::error::{BatchError, PageError};
use crate::model::{Document, TaskStatus};
use crate::progress::BatchState;
use serde::{Deserialize, Serialize};

/// How a chapter batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every page made it into the document.
    Done { document: Document },

    /// A document was produced without the pages listed in `failed`.
    PartialFailure {
        document: Document,
        failed: Vec<PageError>,
    },

    /// No document was produced.
    Failed { error: BatchError },

    /// Cancellation was observed before the batch finished. Any document
    /// built before that point is discarded.
    Cancelled,
}

impl BatchOutcome {
    /// The terminal [`BatchState`] this outcome corresponds to.
    pub fn state(&self) -> BatchState {
        match self {
            BatchOutcome::Done { .. } => BatchState::Done,
            BatchOutcome::PartialFailure { .. } => BatchState::PartialFailure,
            BatchOutcome::Failed { .. } => BatchState::Failed,
            BatchOutcome::Cancelled => BatchState::Cancelled,
        }
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            BatchOutcome::Done { document } | BatchOutcome::PartialFailure { document, .. } => {
                Some(document)
            }
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BatchOutcome::Done { .. })
    }
}

/// Final status of one page within the last batch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 0-based sequence index.
    pub index: usize,
    pub url: String,
    pub status: TaskStatus,
    /// Fetch attempts spent on this page (0 if never started).
    pub attempts: u32,
    /// Set when `status` is `Rejected` or `Failed`.
    pub error: Option<PageError>,
}

/// Aggregate statistics for one chapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Batch attempts made, including the first.
    pub batch_attempts: u32,
    /// Fetch retries summed over all pages and batch attempts.
    pub fetch_retries: u32,
    /// Assembly retries summed over all batch attempts.
    pub assembly_retries: u32,
    /// Pages converted in the final attempt.
    pub converted: usize,
    /// Pages turned away by the quality gate in the final attempt.
    pub rejected: usize,
    /// Pages that failed to fetch or convert in the final attempt.
    pub failed: usize,
    /// Wall-clock time for the whole chapter in milliseconds.
    pub duration_ms: u64,
}

/// Everything the pipeline knows about one processed chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterReport {
    pub chapter_id: String,
    pub outcome: BatchOutcome,
    /// One entry per image URL, in sequence order.
    pub pages: Vec<PageOutcome>,
    pub stats: BatchStats,
}

impl ChapterReport {
    pub fn state(&self) -> BatchState {
        self.outcome.state()
    }

    /// Sequence indices that did not make it into the document.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.status != TaskStatus::Converted)
            .map(|p| p.index)
            .collect()
    }

    /// A compact, serialisable summary for [`crate::store::DocumentStore::record_outcome`].
    pub fn status(&self) -> BatchStatus {
        let error = match &self.outcome {
            BatchOutcome::Failed { error } => Some(error.to_string()),
            _ => None,
        };
        BatchStatus {
            chapter_id: self.chapter_id.clone(),
            state: self.state(),
            pages_total: self.pages.len(),
            pages_included: self
                .outcome
                .document()
                .map(Document::page_count)
                .unwrap_or(0),
            failed_indices: match self.outcome {
                BatchOutcome::Cancelled => Vec::new(),
                _ => self.failed_indices(),
            },
            error,
            stats: self.stats.clone(),
        }
    }
}

/// Serialisable terminal status of a chapter, as recorded by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub chapter_id: String,
    pub state: BatchState,
    pub pages_total: usize,
    pub pages_included: usize,
    pub failed_indices: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stats: BatchStats,
}
