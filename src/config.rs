//! Configuration types for the chapter pipeline.
//!
//! Every knob lives in [`PipelineConfig`], built via its
//! [`PipelineConfigBuilder`] or read from the environment with
//! [`PipelineConfig::from_env`]. One struct keeps configs cheap to clone into
//! worker tasks and easy to log.

use crate::error::ChapterPdfError;
use crate::progress::ProgressSink;
use crate::retry::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for fetching and assembling a chapter.
///
/// # Example
/// ```rust
/// use chapter_pdf::{PageSize, PipelineConfig};
///
/// let config = PipelineConfig::builder()
///     .max_concurrent_downloads(4)
///     .page_size(PageSize::A4)
///     .build()
///     .unwrap();
/// assert_eq!(config.max_concurrent_downloads, 4);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Retries after the first fetch attempt of each image. Default: 3.
    pub max_fetch_retries: u32,

    /// Per-attempt fetch timeout in milliseconds. Default: 10 000.
    pub fetch_timeout_ms: u64,

    /// Retries after the first assembly attempt. Default: 2.
    ///
    /// A document that fails integrity verification counts as a failed
    /// attempt against this budget.
    pub max_assembly_retries: u32,

    /// Per-attempt assembly timeout in milliseconds. Default: 60 000.
    pub assembly_timeout_ms: u64,

    /// Upper bound on fetches in flight at once. Default: 2.
    ///
    /// Image CDNs throttle aggressively; a small pool keeps a chapter well
    /// under typical per-client limits while still overlapping network
    /// latency with decoding work.
    pub max_concurrent_downloads: usize,

    /// Payloads shorter than this are rejected as truncated or placeholder
    /// responses. Default: 1024.
    pub min_image_bytes: usize,

    /// Images narrower or shorter than this many pixels are rejected. Default: 10.
    pub min_image_dimension: u32,

    /// Page geometry of the assembled document. Default: [`PageSize::Letter`].
    pub page_size: PageSize,

    /// Wall-clock budget for the fetch phase of one batch attempt. Default: none.
    ///
    /// When it elapses, assembly starts with whatever pages are ready and
    /// every unfinished image counts as failed.
    pub batch_timeout_ms: Option<u64>,

    /// Retries of a whole batch that ended in `Failed`. Default: 2.
    pub max_batch_retries: u32,

    /// Delay schedule between attempts at every retry level.
    /// Default: exponential, 1 s doubling up to 30 s.
    pub backoff: Backoff,

    /// What to do with a batch where some pages were unusable.
    pub partial_policy: PartialPolicy,

    /// Optional progress receiver.
    pub progress: Option<Arc<dyn ProgressSink>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fetch_retries: 3,
            fetch_timeout_ms: 10_000,
            max_assembly_retries: 2,
            assembly_timeout_ms: 60_000,
            max_concurrent_downloads: 2,
            min_image_bytes: 1024,
            min_image_dimension: 10,
            page_size: PageSize::default(),
            batch_timeout_ms: None,
            max_batch_retries: 2,
            backoff: Backoff::default(),
            partial_policy: PartialPolicy::default(),
            progress: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("max_fetch_retries", &self.max_fetch_retries)
            .field("fetch_timeout_ms", &self.fetch_timeout_ms)
            .field("max_assembly_retries", &self.max_assembly_retries)
            .field("assembly_timeout_ms", &self.assembly_timeout_ms)
            .field("max_concurrent_downloads", &self.max_concurrent_downloads)
            .field("min_image_bytes", &self.min_image_bytes)
            .field("min_image_dimension", &self.min_image_dimension)
            .field("page_size", &self.page_size)
            .field("batch_timeout_ms", &self.batch_timeout_ms)
            .field("max_batch_retries", &self.max_batch_retries)
            .field("backoff", &self.backoff)
            .field("partial_policy", &self.partial_policy)
            .field("progress", &self.progress.as_ref().map(|_| "<dyn ProgressSink>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from process environment variables.
    ///
    /// Recognised keys (unset keys keep their defaults):
    ///
    /// | Variable | Meaning |
    /// |----------|---------|
    /// | `MAX_RETRIES` | fetch retries per image |
    /// | `HTTP_TIMEOUT` | fetch attempt timeout, seconds |
    /// | `MAX_CONCURRENT_DOWNLOADS` | fetch pool size |
    /// | `PDF_PAGE_SIZE` | `letter`, `a4` or `fit` |
    /// | `PDF_CREATION_TIMEOUT` | assembly attempt timeout, seconds |
    /// | `MIN_IMAGE_BYTES` | quality gate byte floor |
    /// | `BATCH_TIMEOUT` | batch fetch budget, seconds |
    /// | `MAX_BATCH_RETRIES` | whole-batch retries |
    pub fn from_env() -> Result<Self, ChapterPdfError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`PipelineConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChapterPdfError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut b = Self::builder();
        if let Some(n) = parse_var::<u32>(&lookup, "MAX_RETRIES")? {
            b = b.max_fetch_retries(n);
        }
        if let Some(ms) = parse_secs_as_ms(&lookup, "HTTP_TIMEOUT")? {
            b = b.fetch_timeout_ms(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MAX_CONCURRENT_DOWNLOADS")? {
            b = b.max_concurrent_downloads(n);
        }
        if let Some(size) = lookup("PDF_PAGE_SIZE") {
            b = b.page_size(size.parse()?);
        }
        if let Some(ms) = parse_secs_as_ms(&lookup, "PDF_CREATION_TIMEOUT")? {
            b = b.assembly_timeout_ms(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MIN_IMAGE_BYTES")? {
            b = b.min_image_bytes(n);
        }
        if let Some(ms) = parse_secs_as_ms(&lookup, "BATCH_TIMEOUT")? {
            b = b.batch_timeout_ms(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "MAX_BATCH_RETRIES")? {
            b = b.max_batch_retries(n);
        }
        b.build()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.assembly_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }

    /// Retry policy for a single image fetch.
    pub fn fetch_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_fetch_retries.saturating_add(1), self.backoff.clone())
    }

    /// Retry policy for document assembly.
    pub fn assembly_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_assembly_retries.saturating_add(1), self.backoff.clone())
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ChapterPdfError>
where
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ChapterPdfError::InvalidConfig(format!("{key} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

fn parse_secs_as_ms(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<u64>, ChapterPdfError> {
    match parse_var::<u64>(lookup, key)? {
        None => Ok(None),
        Some(secs) => secs.checked_mul(1000).map(Some).ok_or_else(|| {
            ChapterPdfError::InvalidConfig(format!("{key} is out of range: {secs} seconds"))
        }),
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn max_fetch_retries(mut self, n: u32) -> Self {
        self.config.max_fetch_retries = n;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.fetch_timeout_ms = ms;
        self
    }

    pub fn max_assembly_retries(mut self, n: u32) -> Self {
        self.config.max_assembly_retries = n;
        self
    }

    pub fn assembly_timeout_ms(mut self, ms: u64) -> Self {
        self.config.assembly_timeout_ms = ms;
        self
    }

    pub fn max_concurrent_downloads(mut self, n: usize) -> Self {
        self.config.max_concurrent_downloads = n.max(1);
        self
    }

    pub fn min_image_bytes(mut self, n: usize) -> Self {
        self.config.min_image_bytes = n;
        self
    }

    pub fn min_image_dimension(mut self, px: u32) -> Self {
        self.config.min_image_dimension = px;
        self
    }

    pub fn page_size(mut self, size: PageSize) -> Self {
        self.config.page_size = size;
        self
    }

    pub fn batch_timeout_ms(mut self, ms: u64) -> Self {
        self.config.batch_timeout_ms = Some(ms);
        self
    }

    pub fn max_batch_retries(mut self, n: u32) -> Self {
        self.config.max_batch_retries = n;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn partial_policy(mut self, policy: PartialPolicy) -> Self {
        self.config.partial_policy = policy;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.config.progress = Some(sink);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ChapterPdfError> {
        let c = &self.config;
        if c.max_concurrent_downloads == 0 {
            return Err(ChapterPdfError::InvalidConfig(
                "max_concurrent_downloads must be ≥ 1".into(),
            ));
        }
        if c.fetch_timeout_ms == 0 {
            return Err(ChapterPdfError::InvalidConfig(
                "fetch_timeout_ms must be > 0".into(),
            ));
        }
        if c.assembly_timeout_ms == 0 {
            return Err(ChapterPdfError::InvalidConfig(
                "assembly_timeout_ms must be > 0".into(),
            ));
        }
        if c.batch_timeout_ms == Some(0) {
            return Err(ChapterPdfError::InvalidConfig(
                "batch_timeout_ms must be > 0 when set".into(),
            ));
        }
        if let PageSize::Custom { width_pt, height_pt } = c.page_size {
            if !(width_pt > 0.0 && height_pt > 0.0) {
                return Err(ChapterPdfError::InvalidConfig(format!(
                    "custom page size must be positive, got {width_pt}x{height_pt}"
                )));
            }
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Page geometry of the assembled document, in PDF points (1/72 inch).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum PageSize {
    /// US Letter, 612 × 792 pt. (default)
    #[default]
    Letter,
    /// ISO A4, 595.276 × 841.89 pt.
    A4,
    /// Every page takes the pixel size of its own image (1 px = 1 pt).
    FitImage,
    /// Fixed custom size.
    Custom { width_pt: f32, height_pt: f32 },
}

impl PageSize {
    /// Page dimensions for an image of the given pixel size.
    pub fn dimensions(&self, image_width: u32, image_height: u32) -> (f32, f32) {
        match *self {
            PageSize::Letter => (612.0, 792.0),
            PageSize::A4 => (595.276, 841.89),
            PageSize::FitImage => (image_width as f32, image_height as f32),
            PageSize::Custom {
                width_pt,
                height_pt,
            } => (width_pt, height_pt),
        }
    }
}

impl std::str::FromStr for PageSize {
    type Err = ChapterPdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "letter" => Ok(PageSize::Letter),
            "a4" => Ok(PageSize::A4),
            "fit" | "fit-image" | "image" => Ok(PageSize::FitImage),
            other => Err(ChapterPdfError::InvalidConfig(format!(
                "unknown page size '{other}' (expected letter, a4 or fit)"
            ))),
        }
    }
}

/// How a batch with some unusable pages is reported.
///
/// | Policy | Behaviour |
/// |--------|-----------|
/// | `Accept` | assemble what is there, report `PartialFailure` (default) |
/// | `Retry`  | retry the whole batch while attempts remain, then report `PartialFailure` |
/// | `Fail`   | treat the batch as `Failed` (retried like any failure) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartialPolicy {
    #[default]
    Accept,
    Retry,
    Fail,
}
