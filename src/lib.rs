//! # chapter-pdf
//!
//! Download the page images of a comic/manga chapter and assemble them into a
//! single, verified PDF.
//!
//! ## Why this crate?
//!
//! Image CDNs are unreliable in mundane ways: connections drop, requests get
//! throttled, and a "successful" response is sometimes a 200-byte placeholder
//! or an HTML error page. This crate treats every image as an independent
//! unit of work with its own retry budget, rejects bad payloads before they
//! reach the document, and reports exactly which pages made it in.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Chapter (ordered image URLs + metadata)
//!  │
//!  ├─ 1. Fetch      bounded pool of downloads, per-attempt timeout + backoff
//!  ├─ 2. Quality    size / signature / header checks
//!  ├─ 3. Normalize  decode and convert to PNG
//!  ├─ 4. Assemble   one page per image, in sequence order (spawn_blocking)
//!  ├─ 5. Verify     %PDF- header and %%EOF trailer
//!  └─ 6. Store      atomic write + outcome log (optional)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chapter_pdf::{Chapter, ChapterMetadata, ChapterPipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = ChapterPipeline::http(PipelineConfig::default())?;
//!     let chapter = Chapter::new(
//!         "a1b2c3",
//!         vec![
//!             "https://cdn.example/data/a1b2c3/1.png".into(),
//!             "https://cdn.example/data/a1b2c3/2.png".into(),
//!         ],
//!         ChapterMetadata::new("Some Title", "12").with_authors(["Someone"]),
//!     );
//!     let report = pipeline.process_chapter(&chapter).await?;
//!     if let Some(doc) = report.outcome.document() {
//!         std::fs::write("chapter.pdf", &doc.bytes)?;
//!     }
//!     eprintln!("{}: {} page(s) converted", report.state(), report.stats.converted);
//!     Ok(())
//! }
//! ```
//!
//! ## Outcomes
//!
//! | Outcome | Document | Meaning |
//! |---------|----------|---------|
//! | `Done`           | yes | every page included |
//! | `PartialFailure` | yes | some pages missing, listed with their errors |
//! | `Failed`         | no  | nothing usable after all batch attempts |
//! | `Cancelled`      | no  | the cancellation token was observed |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod batch;
pub mod cancel;
pub mod config;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod source;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use batch::ChapterPipeline;
pub use cancel::{cancel_on_ctrl_c, CancellationToken};
pub use config::{PageSize, PartialPolicy, PipelineConfig, PipelineConfigBuilder};
pub use error::{
    AssemblyError, BatchError, ChapterPdfError, ConversionError, FetchError, FetchErrorKind,
    IntegrityError, PageError, QualityRejection, SourceError,
};
pub use model::{Chapter, ChapterMetadata, Document, ImageBytes, TaskStatus};
pub use output::{BatchOutcome, BatchStats, BatchStatus, ChapterReport, PageOutcome};
pub use pipeline::assemble::DocumentEncoder;
pub use pipeline::pdf::PdfEncoder;
pub use progress::{BatchState, NoopProgressSink, ProgressEvent, ProgressSink};
pub use retry::{Backoff, RetryPolicy};
pub use source::{ChapterLocator, ContentSource, HttpContentSource, ImageQuality};
pub use store::{DocumentStore, FileStore};
