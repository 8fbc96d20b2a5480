//! Error types for the chapter-pdf library.
//!
//! Errors are split along the same line as the pipeline itself:
//!
//! * **Per-image** errors ([`FetchError`], [`QualityRejection`],
//!   [`ConversionError`]) are contained at the image level. They end up in a
//!   [`PageError`] on the page outcome and degrade the batch toward a partial
//!   failure instead of aborting it.
//!
//! * **Per-document** errors ([`AssemblyError`], [`IntegrityError`]) are
//!   retried inside the assembler and only surface once its budget is spent.
//!
//! * **Per-batch** errors ([`BatchError`]) are what a chapter reports when it
//!   ends in `Failed`.
//!
//! * [`ChapterPdfError`] is **fatal**: the batch cannot even start (bad
//!   config, malformed chapter, locator failure).

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the chapter-pdf library.
#[derive(Debug, Error)]
pub enum ChapterPdfError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The chapter carries no image URLs.
    #[error("Chapter '{chapter_id}' has no image URLs")]
    EmptyChapter { chapter_id: String },

    /// An image URL is empty or not an absolute HTTP(S) URL.
    #[error("Chapter '{chapter_id}': invalid image URL at index {index}: '{url}'")]
    InvalidUrl {
        chapter_id: String,
        index: usize,
        url: String,
    },

    /// The chapter locator could not produce the image list.
    #[error("Could not resolve images for chapter '{chapter_id}': {source}")]
    LocatorFailed {
        chapter_id: String,
        #[source]
        source: SourceError,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or environment validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by a [`crate::source::ContentSource`] or
/// [`crate::source::ChapterLocator`].
///
/// Rate-limit and auth responses stay distinguishable so callers can tell a
/// throttled server from a revoked session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// Connection refused, DNS failure, body read error, …
    #[error("network error: {0}")]
    Network(String),

    /// The transport gave up waiting.
    #[error("request timed out")]
    Timeout,

    /// Non-success HTTP status.
    #[error("HTTP {status}")]
    Status { status: u16 },

    /// HTTP 429.
    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 401/403.
    #[error("unauthorized (HTTP {status})")]
    Unauthorized { status: u16 },
}

/// Why a single fetch ended without bytes.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FetchErrorKind {
    Network(String),
    Timeout,
    HttpStatus(u16),
    Cancelled,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchErrorKind::Network(detail) => write!(f, "network error: {detail}"),
            FetchErrorKind::Timeout => f.write_str("timed out"),
            FetchErrorKind::HttpStatus(status) => write!(f, "HTTP {status}"),
            FetchErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl From<&SourceError> for FetchErrorKind {
    fn from(err: &SourceError) -> Self {
        match err {
            SourceError::Network(detail) => FetchErrorKind::Network(detail.clone()),
            SourceError::Timeout => FetchErrorKind::Timeout,
            SourceError::Status { status } | SourceError::Unauthorized { status } => {
                FetchErrorKind::HttpStatus(*status)
            }
            SourceError::RateLimited { .. } => FetchErrorKind::HttpStatus(429),
        }
    }
}

/// A fetch that exhausted its attempt budget or was cancelled.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("fetching '{url}' failed after {attempts} attempt(s): {kind}")]
pub struct FetchError {
    pub url: String,
    pub attempts: u32,
    pub kind: FetchErrorKind,
}

/// Reasons the quality gate turns an image away.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QualityRejection {
    #[error("payload too small: {len} bytes (minimum {min})")]
    TooSmall { len: usize, min: usize },

    #[error("unrecognised image signature {magic:02x?}")]
    BadSignature { magic: Vec<u8> },

    #[error("truncated payload: received {received} of {declared} declared bytes")]
    Truncated { declared: u64, received: usize },

    #[error("image is {width}x{height} px (minimum {min} px per side)")]
    Undersized { width: u32, height: u32, min: u32 },

    #[error("unreadable image header: {detail}")]
    Corrupt { detail: String },
}

/// Normalisation failure on an image that passed the quality gate.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConversionError {
    #[error("corrupt image payload: {detail}")]
    CorruptPayload { detail: String },
}

/// Structural defects found in an assembled document.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("document does not start with the %PDF- header")]
    MissingHeader,

    #[error("no %%EOF marker in the trailing window")]
    MissingTrailer,
}

/// Failure of one assembly attempt, or of the whole retry loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("assembly attempt timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("document encoding failed: {0}")]
    EncodingFailure(String),

    #[error("assembled document failed verification: {0}")]
    IntegrityFailed(#[from] IntegrityError),

    #[error("assembly cancelled")]
    Cancelled,
}

/// Why a chapter batch ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BatchError {
    /// Every batch attempt ended without a usable document.
    #[error("all {attempts} batch attempt(s) exhausted; last error: {last_error}")]
    AllAttemptsExhausted { attempts: u32, last_error: String },

    /// Not a single page survived fetching, the quality gate and conversion.
    #[error("none of the {total} page(s) could be used")]
    NoUsablePages { total: usize },

    /// The document was built but the store refused it.
    #[error("storing the document failed: {0}")]
    StoreFailed(String),
}

/// A non-fatal error for a single page.
///
/// Stored on [`crate::output::PageOutcome`] so the caller gets a full account
/// of which sequence indices failed and why.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    #[error("page {index}: {source}")]
    Fetch {
        index: usize,
        #[source]
        source: FetchError,
    },

    #[error("page {index}: rejected: {reason}")]
    Rejected {
        index: usize,
        reason: QualityRejection,
    },

    #[error("page {index}: {source}")]
    Conversion {
        index: usize,
        #[source]
        source: ConversionError,
    },

    #[error("page {index}: unfinished when the batch timeout elapsed")]
    BatchTimeout { index: usize },

    #[error("page {index}: cancelled")]
    Cancelled { index: usize },

    /// The worker handling this page panicked.
    #[error("page {index}: worker crashed: {detail}")]
    WorkerPanicked { index: usize, detail: String },
}

impl PageError {
    /// Sequence index of the page this error belongs to.
    pub fn index(&self) -> usize {
        match self {
            PageError::Fetch { index, .. }
            | PageError::Rejected { index, .. }
            | PageError::Conversion { index, .. }
            | PageError::BatchTimeout { index }
            | PageError::Cancelled { index }
            | PageError::WorkerPanicked { index, .. } => *index,
        }
    }
}
