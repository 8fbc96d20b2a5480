//! BatchOrchestrator: drive one chapter from image URLs to a stored document.
//!
//! ```text
//! Pending ─▶ Fetching ─▶ Converting ─▶ Assembling ─▶ Verifying ─┬─▶ Done
//!              │  JoinSet of workers, at most                    ├─▶ PartialFailure
//!              │  `max_concurrent_downloads` holding a permit    ├─▶ Failed
//!              │  each: fetch → quality gate → normalise         └─▶ Cancelled
//!              └─ optional batch deadline cancels the attempt's child token
//! ```
//!
//! A batch attempt works on fresh [`ImageTask`]s. Attempts that end without
//! a usable document are retried up to `max_batch_retries` times; partial
//! results are handled per [`PartialPolicy`]. Every worker is awaited before
//! an attempt returns, so no fetch outlives the call that started it.

use crate::config::{PartialPolicy, PipelineConfig};
use crate::error::{
    AssemblyError, BatchError, ChapterPdfError, FetchErrorKind, PageError, QualityRejection,
};
use crate::model::{Chapter, ChapterMetadata, Document, ImageTask, NormalizedPage, TaskStatus};
use crate::output::{BatchOutcome, BatchStats, ChapterReport, PageOutcome};
use crate::pipeline::assemble::{Assembler, AssemblyFailure, DocumentEncoder};
use crate::pipeline::fetch::{fetch, is_valid_url, FetchContext};
use crate::pipeline::normalize::normalize;
use crate::pipeline::pdf::PdfEncoder;
use crate::pipeline::quality::{self, QualityThresholds};
use crate::progress::{emit, BatchState, ProgressEvent};
use crate::source::{ChapterLocator, ContentSource, HttpContentSource, ImageQuality};
use crate::store::DocumentStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What a single worker ended with.
enum Worker {
    Converted { page: NormalizedPage, attempts: u32 },
    Rejected { attempts: u32, reason: QualityRejection },
    Failed { attempts: u32, error: PageError },
    Cancelled { attempts: u32 },
}

/// What a single batch attempt ended with.
enum AttemptResult {
    Assembled {
        document: Document,
        failed: Vec<PageError>,
    },
    NoUsablePages,
    AssemblyFailed(AssemblyFailure),
    Cancelled,
}

struct AttemptRun {
    pages: Vec<PageOutcome>,
    result: AttemptResult,
}

/// Fetches, validates and assembles chapters into documents.
///
/// # Example
/// ```rust,no_run
/// use chapter_pdf::{cancel_on_ctrl_c, Chapter, ChapterMetadata, ChapterPipeline, FileStore, PipelineConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let pipeline = ChapterPipeline::http(PipelineConfig::from_env()?)?
///     .with_store(Arc::new(FileStore::new("downloads")));
/// cancel_on_ctrl_c(pipeline.cancellation_token());
///
/// let chapter = Chapter::new(
///     "a1b2c3",
///     vec!["https://cdn.example/data/a1b2c3/1.png".into()],
///     ChapterMetadata::new("Some Title", "12"),
/// );
/// let report = pipeline.process_chapter(&chapter).await?;
/// println!("{}: {}", report.chapter_id, report.state());
/// # Ok(())
/// # }
/// ```
pub struct ChapterPipeline {
    config: PipelineConfig,
    source: Arc<dyn ContentSource>,
    encoder: Arc<dyn DocumentEncoder>,
    store: Option<Arc<dyn DocumentStore>>,
    cancel: CancellationToken,
}

impl ChapterPipeline {
    /// A pipeline reading from `source` and writing PDFs with [`PdfEncoder`].
    pub fn new(config: PipelineConfig, source: Arc<dyn ContentSource>) -> Self {
        Self {
            config,
            source,
            encoder: Arc::new(PdfEncoder::default()),
            store: None,
            cancel: CancellationToken::new(),
        }
    }

    /// A pipeline backed by [`HttpContentSource`].
    pub fn http(config: PipelineConfig) -> Result<Self, ChapterPdfError> {
        let source = HttpContentSource::new()
            .map_err(|e| ChapterPdfError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self::new(config, Arc::new(source)))
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn DocumentEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle to the run-wide token; cancelling it stops every batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolve `chapter_id` through `locator`, then process it.
    pub async fn process_chapter_id(
        &self,
        locator: &dyn ChapterLocator,
        chapter_id: &str,
        metadata: ChapterMetadata,
        quality: ImageQuality,
    ) -> Result<ChapterReport, ChapterPdfError> {
        let urls = locator
            .get_image_urls(chapter_id, quality)
            .await
            .map_err(|source| ChapterPdfError::LocatorFailed {
                chapter_id: chapter_id.to_string(),
                source,
            })?;
        debug!(
            "Chapter '{}': locator returned {} URL(s) ({})",
            chapter_id,
            urls.len(),
            quality.as_path()
        );
        self.process_chapter(&Chapter::new(chapter_id, urls, metadata))
            .await
    }

    /// Process `chapters` in order.
    ///
    /// A failed chapter does not stop the run. Once the token is cancelled,
    /// the remaining chapters are reported `Cancelled` without any work.
    pub async fn process_chapters(
        &self,
        chapters: &[Chapter],
    ) -> Vec<Result<ChapterReport, ChapterPdfError>> {
        let mut reports = Vec::with_capacity(chapters.len());
        for (i, chapter) in chapters.iter().enumerate() {
            info!(
                "Chapter {}/{}: '{}' ({} - Chapter {})",
                i + 1,
                chapters.len(),
                chapter.id,
                chapter.metadata.title,
                chapter.metadata.chapter_number
            );
            let report = self.process_chapter(chapter).await;
            if let Err(ref e) = report {
                error!("Chapter '{}' could not start: {}", chapter.id, e);
            }
            reports.push(report);
        }
        reports
    }

    /// Run one chapter to a terminal state.
    ///
    /// Returns `Err` only when the chapter itself is malformed; every runtime
    /// failure ends up in the report's [`BatchOutcome`].
    pub async fn process_chapter(&self, chapter: &Chapter) -> Result<ChapterReport, ChapterPdfError> {
        validate_chapter(chapter)?;

        let started = Instant::now();
        let total = chapter.image_urls.len();
        let max_attempts = self.config.max_batch_retries.saturating_add(1);
        let progress = self.config.progress.as_ref();
        let mut stats = BatchStats::default();
        let mut pages = pending_pages(chapter);

        emit(progress, ProgressEvent::new(BatchState::Pending, 0, total));

        let mut settled: Option<BatchOutcome> = None;
        let mut last_error: Option<BatchError> = None;
        let mut retained: Option<(Document, Vec<PageError>, Vec<PageOutcome>)> = None;

        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                settled = Some(BatchOutcome::Cancelled);
                break;
            }
            stats.batch_attempts = attempt;
            info!(
                "Chapter '{}': batch attempt {}/{} over {} image(s)",
                chapter.id, attempt, max_attempts, total
            );

            let run = self.run_attempt(chapter, &mut stats).await;
            pages = run.pages;

            match run.result {
                AttemptResult::Cancelled => {
                    settled = Some(BatchOutcome::Cancelled);
                    break;
                }
                AttemptResult::Assembled { document, failed } if failed.is_empty() => {
                    settled = Some(BatchOutcome::Done { document });
                    break;
                }
                AttemptResult::Assembled { document, failed } => {
                    let error = BatchError::AllAttemptsExhausted {
                        attempts: attempt,
                        last_error: format!("{} of {} page(s) unusable", failed.len(), total),
                    };
                    match self.config.partial_policy {
                        PartialPolicy::Accept => {
                            settled = Some(BatchOutcome::PartialFailure { document, failed });
                            break;
                        }
                        PartialPolicy::Retry => {
                            retained = Some((document, failed, pages.clone()));
                        }
                        PartialPolicy::Fail => {}
                    }
                    last_error = Some(error);
                }
                AttemptResult::NoUsablePages => {
                    last_error = Some(BatchError::NoUsablePages { total });
                }
                AttemptResult::AssemblyFailed(failure) => {
                    last_error = Some(BatchError::AllAttemptsExhausted {
                        attempts: attempt,
                        last_error: failure.error.to_string(),
                    });
                }
            }

            if attempt < max_attempts {
                let delay = self.config.backoff.delay(attempt);
                warn!(
                    "Chapter '{}': batch attempt {}/{} unsuccessful ({}), retrying in {:?}",
                    chapter.id,
                    attempt,
                    max_attempts,
                    last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                    delay
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        settled = Some(BatchOutcome::Cancelled);
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        let mut outcome = match settled {
            Some(outcome) => outcome,
            None => match retained {
                Some((document, failed, kept)) => {
                    pages = kept;
                    BatchOutcome::PartialFailure { document, failed }
                }
                None => BatchOutcome::Failed {
                    error: last_error.unwrap_or(BatchError::NoUsablePages { total }),
                },
            },
        };

        // A document finished after cancellation is discarded, never stored.
        if outcome.document().is_some() && self.cancel.is_cancelled() {
            outcome = BatchOutcome::Cancelled;
        }

        let store_failure = match (&self.store, outcome.document()) {
            (Some(store), Some(document)) => store
                .store_document(&chapter.id, document, &chapter.metadata)
                .await
                .err(),
            _ => None,
        };
        if let Some(e) = store_failure {
            error!("Chapter '{}': could not store document: {}", chapter.id, e);
            outcome = BatchOutcome::Failed {
                error: BatchError::StoreFailed(e.to_string()),
            };
        }

        stats.converted = count(&pages, TaskStatus::Converted);
        stats.rejected = count(&pages, TaskStatus::Rejected);
        stats.failed = count(&pages, TaskStatus::Failed);
        stats.duration_ms = started.elapsed().as_millis() as u64;

        let report = ChapterReport {
            chapter_id: chapter.id.clone(),
            outcome,
            pages,
            stats,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.record_outcome(&chapter.id, &report.status()).await {
                warn!("Chapter '{}': could not record outcome: {}", chapter.id, e);
            }
        }

        let state = report.state();
        emit(
            progress,
            ProgressEvent::new(state, report.stats.converted, total),
        );
        match &report.outcome {
            BatchOutcome::Done { document } => info!(
                "Chapter '{}': done, {} page(s), {} bytes in {}ms",
                chapter.id,
                document.page_count(),
                document.bytes.len(),
                report.stats.duration_ms
            ),
            BatchOutcome::PartialFailure { document, failed } => warn!(
                "Chapter '{}': partial, {} page(s) included, missing {:?}",
                chapter.id,
                document.page_count(),
                failed.iter().map(PageError::index).collect::<Vec<_>>()
            ),
            BatchOutcome::Failed { error } => {
                error!("Chapter '{}': failed: {}", chapter.id, error)
            }
            BatchOutcome::Cancelled => info!("Chapter '{}': cancelled", chapter.id),
        }

        Ok(report)
    }

    /// One batch attempt: fan out the workers, then assemble what came back.
    async fn run_attempt(&self, chapter: &Chapter, stats: &mut BatchStats) -> AttemptRun {
        let total = chapter.image_urls.len();
        let progress = self.config.progress.clone();
        let attempt_cancel = self.cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_downloads.max(1)));
        let converted_count = Arc::new(AtomicUsize::new(0));
        let fetched_count = Arc::new(AtomicUsize::new(0));
        let thresholds = QualityThresholds {
            min_bytes: self.config.min_image_bytes,
            min_dimension: self.config.min_image_dimension,
        };
        let fetch_policy = self.config.fetch_policy();
        let fetch_timeout = self.config.fetch_timeout();

        let tasks: Vec<ImageTask> = chapter
            .image_urls
            .iter()
            .enumerate()
            .map(|(i, url)| ImageTask::new(i, url.as_str()))
            .collect();
        let mut pages: Vec<PageOutcome> = tasks
            .iter()
            .map(|t| PageOutcome {
                index: t.index,
                url: t.url.clone(),
                status: t.status,
                attempts: 0,
                error: None,
            })
            .collect();

        emit(
            progress.as_ref(),
            ProgressEvent::new(BatchState::Fetching, 0, total),
        );

        let mut set: JoinSet<(ImageTask, Worker)> = JoinSet::new();
        let mut spawned: HashMap<tokio::task::Id, usize> = HashMap::with_capacity(total);
        for mut task in tasks {
            let index = task.index;
            let source = Arc::clone(&self.source);
            let semaphore = Arc::clone(&semaphore);
            let cancel = attempt_cancel.clone();
            let policy = fetch_policy.clone();
            let progress = progress.clone();
            let converted_count = Arc::clone(&converted_count);
            let fetched_count = Arc::clone(&fetched_count);

            let handle = set.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        task.advance(TaskStatus::Failed);
                        return (task, Worker::Cancelled { attempts: 0 });
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            task.advance(TaskStatus::Failed);
                            return (task, Worker::Cancelled { attempts: 0 });
                        }
                    },
                };

                let ctx = FetchContext {
                    source: source.as_ref(),
                    policy: &policy,
                    attempt_timeout: fetch_timeout,
                    cancel: &cancel,
                    progress: progress.as_ref(),
                    total,
                    fetched: &fetched_count,
                };
                let fetched = match fetch(&ctx, index, &task.url).await {
                    Ok(fetched) => fetched,
                    Err(e) if e.kind == FetchErrorKind::Cancelled => {
                        task.advance(TaskStatus::Failed);
                        return (task, Worker::Cancelled { attempts: e.attempts });
                    }
                    Err(e) => {
                        warn!("Page {}: {}", index, e);
                        task.advance(TaskStatus::Failed);
                        let attempts = e.attempts;
                        return (
                            task,
                            Worker::Failed {
                                attempts,
                                error: PageError::Fetch { index, source: e },
                            },
                        );
                    }
                };
                task.advance(TaskStatus::Fetched);
                let attempts = fetched.attempts;

                if cancel.is_cancelled() {
                    debug!("Page {}: fetched, stopped before conversion", index);
                    task.advance(TaskStatus::Failed);
                    return (task, Worker::Cancelled { attempts });
                }

                let format = match quality::check(&fetched.raw, &thresholds) {
                    Ok(format) => format,
                    Err(reason) => {
                        warn!("Page {}: rejected: {}", index, reason);
                        task.advance(TaskStatus::Rejected);
                        return (task, Worker::Rejected { attempts, reason });
                    }
                };

                match normalize(&fetched.raw, format) {
                    Ok(page) => {
                        task.advance(TaskStatus::Converted);
                        let done = converted_count.fetch_add(1, Ordering::SeqCst) + 1;
                        emit(
                            progress.as_ref(),
                            ProgressEvent::new(BatchState::Converting, done, total)
                                .with_message(format!("page {index}")),
                        );
                        (task, Worker::Converted { page, attempts })
                    }
                    Err(e) => {
                        warn!("Page {}: {}", index, e);
                        task.advance(TaskStatus::Failed);
                        (
                            task,
                            Worker::Failed {
                                attempts,
                                error: PageError::Conversion { index, source: e },
                            },
                        )
                    }
                }
            });
            spawned.insert(handle.id(), index);
        }

        let deadline = self
            .config
            .batch_timeout()
            .map(|budget| tokio::time::Instant::now() + budget);
        let mut timed_out = false;
        let mut converted: Vec<NormalizedPage> = Vec::with_capacity(total);

        loop {
            let next = match deadline {
                Some(at) if !timed_out => {
                    let waited = tokio::time::timeout_at(at, set.join_next()).await;
                    match waited {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                "Chapter '{}': batch timeout elapsed with {} worker(s) unfinished",
                                chapter.id,
                                set.len()
                            );
                            timed_out = true;
                            attempt_cancel.cancel();
                            continue;
                        }
                    }
                }
                _ => set.join_next().await,
            };
            let Some(joined) = next else { break };

            let (task, worker) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Chapter '{}': worker task failed: {}", chapter.id, e);
                    let lost = spawned.get(&e.id()).and_then(|&i| pages.get_mut(i));
                    if let (Some(page), true) = (lost, e.is_panic()) {
                        page.status = TaskStatus::Failed;
                        page.error = Some(PageError::WorkerPanicked {
                            index: page.index,
                            detail: panic_detail(e),
                        });
                    }
                    continue;
                }
            };
            let index = task.index;
            let Some(page) = pages.get_mut(index) else {
                continue;
            };
            page.status = task.status;
            match worker {
                // Finished past the deadline: too late for this attempt.
                Worker::Converted { attempts, .. } if timed_out => {
                    page.status = TaskStatus::Failed;
                    page.attempts = attempts;
                    page.error = Some(interrupted(index, timed_out, &self.cancel));
                }
                Worker::Converted { page: normalized, attempts } => {
                    page.attempts = attempts;
                    converted.push(normalized);
                }
                Worker::Rejected { attempts, reason } => {
                    page.attempts = attempts;
                    page.error = Some(PageError::Rejected { index, reason });
                }
                Worker::Failed { attempts, error } => {
                    page.attempts = attempts;
                    page.error = Some(error);
                }
                Worker::Cancelled { attempts } => {
                    page.attempts = attempts;
                    page.error = Some(interrupted(index, timed_out, &self.cancel));
                }
            }
        }

        // Workers that never reported count as interrupted.
        for page in pages.iter_mut().filter(|p| !p.status.is_terminal()) {
            page.status = TaskStatus::Failed;
            page.error = Some(interrupted(page.index, timed_out, &self.cancel));
        }

        stats.fetch_retries += pages
            .iter()
            .map(|p| p.attempts.saturating_sub(1))
            .sum::<u32>();

        if self.cancel.is_cancelled() {
            return AttemptRun {
                pages,
                result: AttemptResult::Cancelled,
            };
        }
        if converted.is_empty() {
            warn!("Chapter '{}': no usable pages in this attempt", chapter.id);
            return AttemptRun {
                pages,
                result: AttemptResult::NoUsablePages,
            };
        }

        let failed: Vec<PageError> = pages.iter().filter_map(|p| p.error.clone()).collect();
        debug!(
            "Chapter '{}': {} page(s) converted, {} unusable; assembling",
            chapter.id,
            converted.len(),
            failed.len()
        );

        let assembler = Assembler::new(
            Arc::clone(&self.encoder),
            self.config.assembly_policy(),
            self.config.assembly_timeout(),
            self.config.page_size,
        );
        let result = match assembler
            .assemble_with_retry(converted, &chapter.metadata, &self.cancel, progress.as_ref())
            .await
        {
            Ok(assembled) => {
                stats.assembly_retries += assembled.retries();
                AttemptResult::Assembled {
                    document: assembled.document,
                    failed,
                }
            }
            Err(failure) => {
                stats.assembly_retries += failure.attempts.saturating_sub(1);
                if failure.error == AssemblyError::Cancelled {
                    AttemptResult::Cancelled
                } else {
                    error!(
                        "Chapter '{}': assembly gave up after {} attempt(s): {}",
                        chapter.id, failure.attempts, failure.error
                    );
                    AttemptResult::AssemblyFailed(failure)
                }
            }
        };

        AttemptRun { pages, result }
    }
}

/// Reject chapters that cannot be scheduled at all.
fn validate_chapter(chapter: &Chapter) -> Result<(), ChapterPdfError> {
    if chapter.image_urls.is_empty() {
        return Err(ChapterPdfError::EmptyChapter {
            chapter_id: chapter.id.clone(),
        });
    }
    if let Some((index, url)) = chapter
        .image_urls
        .iter()
        .enumerate()
        .find(|(_, url)| !is_valid_url(url))
    {
        return Err(ChapterPdfError::InvalidUrl {
            chapter_id: chapter.id.clone(),
            index,
            url: url.clone(),
        });
    }
    Ok(())
}

fn pending_pages(chapter: &Chapter) -> Vec<PageOutcome> {
    chapter
        .image_urls
        .iter()
        .enumerate()
        .map(|(index, url)| PageOutcome {
            index,
            url: url.clone(),
            status: TaskStatus::Pending,
            attempts: 0,
            error: None,
        })
        .collect()
}

/// The panic message of a crashed worker, when it carried one.
fn panic_detail(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Error for a page stopped by the deadline or by cancellation.
fn interrupted(index: usize, timed_out: bool, run: &CancellationToken) -> PageError {
    if timed_out && !run.is_cancelled() {
        PageError::BatchTimeout { index }
    } else {
        PageError::Cancelled { index }
    }
}

fn count(pages: &[PageOutcome], status: TaskStatus) -> usize {
    pages.iter().filter(|p| p.status == status).count()
}
