//! Shared fixtures for the integration tests: an in-memory image CDN, a
//! recording document store and misbehaving encoders.

#![allow(dead_code)]

use async_trait::async_trait;
use chapter_pdf::{
    AssemblyError, Backoff, BatchStatus, ChapterMetadata, ChapterPdfError, ContentSource,
    Document, DocumentEncoder, DocumentStore, ImageBytes, PageSize, PdfEncoder,
    PipelineConfig, PipelineConfigBuilder, SourceError,
};
use chapter_pdf::model::NormalizedPage;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// ── Logging ─────────────────────────────────────────────────────────────────

/// Route library logs to the test writer; `RUST_LOG=chapter_pdf=debug` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Images ──────────────────────────────────────────────────────────────────

/// A noisy RGB PNG, large enough to clear a 64-byte quality threshold.
pub fn png(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 37 + y * 11) as u8, (x * 5 + y * 29) as u8, ((x ^ y) * 3) as u8])
    }));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn url(index: usize) -> String {
    format!("https://cdn.test/data/chapter/{index}.png")
}

pub fn urls(n: usize) -> Vec<String> {
    (0..n).map(url).collect()
}

/// Page width used for image `index`, so page order can be read back from the PDF.
pub fn width_for(index: usize) -> u32 {
    20 + index as u32
}

// ── Fake CDN ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Reply {
    /// A valid PNG `width_for(index)` wide.
    Image { index: usize, delay_ms: u64 },
    /// These exact bytes.
    Raw(Vec<u8>),
    /// Always this HTTP status.
    Status(u16),
    /// `failures` × HTTP 503, then a valid PNG.
    Flaky { index: usize, failures: u32 },
    /// Panics inside the request.
    Panic,
}

/// In-memory [`ContentSource`] that counts calls and concurrent requests.
#[derive(Default)]
pub struct FakeCdn {
    replies: HashMap<String, Reply>,
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCdn {
    /// Every URL in `0..n` serves a valid image immediately.
    pub fn healthy(n: usize) -> Self {
        let mut cdn = Self::default();
        for i in 0..n {
            cdn = cdn.with(i, Reply::Image { index: i, delay_ms: 0 });
        }
        cdn
    }

    pub fn with(mut self, index: usize, reply: Reply) -> Self {
        self.replies.insert(url(index), reply);
        self
    }

    pub fn calls(&self, index: usize) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&url(index))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentSource for FakeCdn {
    async fn get_image_bytes(&self, url: &str) -> Result<ImageBytes, SourceError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(url.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self.replies.get(url).cloned();
        let result = match reply {
            Some(Reply::Image { index, delay_ms }) => {
                if delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Ok(ImageBytes::from(png(width_for(index), 24)))
            }
            Some(Reply::Raw(bytes)) => Ok(ImageBytes::from(bytes)),
            Some(Reply::Status(status)) => Err(SourceError::Status { status }),
            Some(Reply::Flaky { index, failures }) => {
                if call <= failures {
                    Err(SourceError::Status { status: 503 })
                } else {
                    Ok(ImageBytes::from(png(width_for(index), 24)))
                }
            }
            Some(Reply::Panic) => panic!("CDN blew up serving {url}"),
            None => Err(SourceError::Status { status: 404 }),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ── Stores ──────────────────────────────────────────────────────────────────

/// Keeps everything it is given in memory.
#[derive(Default)]
pub struct MemoryStore {
    pub documents: Mutex<Vec<(String, Document)>>,
    pub outcomes: Mutex<Vec<BatchStatus>>,
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn store_document(
        &self,
        chapter_id: &str,
        document: &Document,
        _metadata: &ChapterMetadata,
    ) -> Result<(), ChapterPdfError> {
        self.documents
            .lock()
            .unwrap()
            .push((chapter_id.to_string(), document.clone()));
        Ok(())
    }

    async fn record_outcome(
        &self,
        _chapter_id: &str,
        status: &BatchStatus,
    ) -> Result<(), ChapterPdfError> {
        self.outcomes.lock().unwrap().push(status.clone());
        Ok(())
    }
}

// ── Encoders ────────────────────────────────────────────────────────────────

/// Blocks for `stall` on its first `stalls` calls, then behaves like [`PdfEncoder`].
pub struct StallingEncoder {
    pub calls: AtomicU32,
    /// Calls that have returned.
    pub finished: AtomicU32,
    pub stalls: u32,
    pub stall: Duration,
}

impl StallingEncoder {
    pub fn new(stalls: u32, stall: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            finished: AtomicU32::new(0),
            stalls,
            stall,
        }
    }
}

impl DocumentEncoder for StallingEncoder {
    fn encode(
        &self,
        pages: &[NormalizedPage],
        metadata: &ChapterMetadata,
        page_size: PageSize,
    ) -> Result<Vec<u8>, AssemblyError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.stalls {
            std::thread::sleep(self.stall);
        }
        let out = PdfEncoder::default().encode(pages, metadata, page_size);
        self.finished.fetch_add(1, Ordering::SeqCst);
        out
    }
}

/// Writes a real PDF and then cuts off its trailer.
#[derive(Default)]
pub struct TruncatingEncoder {
    pub calls: AtomicU32,
}

impl DocumentEncoder for TruncatingEncoder {
    fn encode(
        &self,
        pages: &[NormalizedPage],
        metadata: &ChapterMetadata,
        page_size: PageSize,
    ) -> Result<Vec<u8>, AssemblyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut bytes = PdfEncoder::default().encode(pages, metadata, page_size)?;
        let cut = bytes
            .windows(5)
            .rposition(|w| w == b"%%EOF")
            .unwrap_or(bytes.len());
        bytes.truncate(cut);
        Ok(bytes)
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

/// Test defaults: tiny thresholds, millisecond backoff.
pub fn config() -> PipelineConfigBuilder {
    PipelineConfig::builder()
        .min_image_bytes(64)
        .backoff(Backoff::Constant { delay_ms: 1 })
        .max_concurrent_downloads(2)
}

pub fn metadata() -> ChapterMetadata {
    ChapterMetadata::new("Night Market", "7")
        .with_authors(["A. Writer"])
        .with_language("en")
}

// ── PDF inspection ──────────────────────────────────────────────────────────

/// Width of the image on each page, in page order.
pub fn page_image_widths(bytes: &[u8]) -> Vec<i64> {
    let doc = lopdf::Document::load_mem(bytes).unwrap();
    doc.get_pages()
        .values()
        .map(|&page_id| {
            let xobjects = doc
                .get_dictionary(page_id)
                .unwrap()
                .get(b"Resources")
                .unwrap()
                .as_dict()
                .unwrap()
                .get(b"XObject")
                .unwrap()
                .as_dict()
                .unwrap();
            let image_id = xobjects.get(b"Im0").unwrap().as_reference().unwrap();
            doc.get_object(image_id)
                .unwrap()
                .as_stream()
                .unwrap()
                .dict
                .get(b"Width")
                .unwrap()
                .as_i64()
                .unwrap()
        })
        .collect()
}
