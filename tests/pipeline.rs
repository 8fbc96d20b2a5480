//! Integration tests for the chapter pipeline.
//!
//! Every test runs against the in-memory CDN in `common`, so nothing here
//! touches the network. Timings are kept in the tens of milliseconds.
//!
//! Run with logs:
//!   RUST_LOG=chapter_pdf=debug cargo test --test pipeline -- --nocapture

mod common;

use chapter_pdf::pipeline::verify::verify;
use chapter_pdf::{
    BatchError, BatchOutcome, BatchState, CancellationToken, Chapter, ChapterPipeline,
    FetchErrorKind, FileStore, PageError, PartialPolicy, ProgressEvent, QualityRejection,
    TaskStatus,
};
use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

fn chapter(id: &str, n: usize) -> Chapter {
    Chapter::new(id, urls(n), metadata())
}

// ── End-to-end scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn test_all_pages_succeed() {
    init_tracing();
    let cdn = Arc::new(FakeCdn::healthy(5));
    let store = Arc::new(MemoryStore::default());
    let pipeline = ChapterPipeline::new(config().build().unwrap(), cdn.clone())
        .with_store(store.clone());

    let report = pipeline.process_chapter(&chapter("c1", 5)).await.unwrap();

    let BatchOutcome::Done { document } = &report.outcome else {
        panic!("expected Done, got {:?}", report.state());
    };
    assert_eq!(document.page_indices, vec![0, 1, 2, 3, 4]);
    assert_ok!(verify(&document.bytes));
    assert_eq!(page_image_widths(&document.bytes), vec![20, 21, 22, 23, 24]);

    assert_eq!(report.stats.batch_attempts, 1);
    assert_eq!(report.stats.fetch_retries, 0);
    assert_eq!(report.stats.assembly_retries, 0);
    assert_eq!(report.stats.converted, 5);
    assert!(report.pages.iter().all(|p| p.status == TaskStatus::Converted));

    assert_eq!(store.documents.lock().unwrap().len(), 1);
    let outcomes = store.outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].state, BatchState::Done);
}

#[tokio::test]
async fn test_tiny_payload_is_rejected_and_batch_is_partial() {
    init_tracing();
    let cdn = Arc::new(FakeCdn::healthy(5).with(2, Reply::Raw(b"\x89PNG\r\n\x1a\n".to_vec())));
    let pipeline = ChapterPipeline::new(config().build().unwrap(), cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 5)).await.unwrap();

    let BatchOutcome::PartialFailure { document, failed } = &report.outcome else {
        panic!("expected PartialFailure, got {:?}", report.state());
    };
    assert_eq!(
        failed,
        &vec![PageError::Rejected {
            index: 2,
            reason: QualityRejection::TooSmall { len: 8, min: 64 },
        }]
    );
    assert_eq!(document.page_count(), 4);
    assert_eq!(document.page_indices, vec![0, 1, 3, 4]);
    assert_eq!(page_image_widths(&document.bytes), vec![20, 21, 23, 24]);

    // Rejections are final for the attempt: the image is not re-fetched.
    assert_eq!(cdn.calls(2), 1);
    assert_eq!(report.pages[2].status, TaskStatus::Rejected);
    assert_eq!(report.stats.rejected, 1);
}

#[tokio::test]
async fn test_assembly_timeouts_are_retried() {
    init_tracing();
    let encoder = Arc::new(StallingEncoder::new(2, Duration::from_millis(400)));
    let config = config()
        .assembly_timeout_ms(100)
        .max_assembly_retries(2)
        .build()
        .unwrap();
    let pipeline =
        ChapterPipeline::new(config, Arc::new(FakeCdn::healthy(3))).with_encoder(encoder.clone());

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    assert!(report.outcome.is_done(), "got {:?}", report.outcome.state());
    assert_eq!(report.stats.assembly_retries, 2);
    assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(encoder.finished.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_during_stalled_assembly_waits_for_encoder() {
    init_tracing();
    let token = CancellationToken::new();
    let sink = {
        let token = token.clone();
        move |event: &ProgressEvent| {
            if event.stage == BatchState::Assembling {
                token.cancel();
            }
        }
    };
    let encoder = Arc::new(StallingEncoder::new(u32::MAX, Duration::from_millis(600)));
    let config = config()
        .assembly_timeout_ms(50)
        .progress(Arc::new(sink))
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, Arc::new(FakeCdn::healthy(2)))
        .with_encoder(encoder.clone())
        .with_cancellation(token);

    let report = pipeline.process_chapter(&chapter("c1", 2)).await.unwrap();

    assert!(matches!(report.outcome, BatchOutcome::Cancelled));
    assert_eq!(encoder.calls.load(Ordering::SeqCst), 1);
    // The stalled encode finished before process_chapter returned.
    assert_eq!(encoder.finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancellation_mid_batch_stops_after_converted_pages() {
    init_tracing();
    let token = CancellationToken::new();
    let converting = Arc::new(AtomicUsize::new(0));
    let sink = {
        let token = token.clone();
        let converting = Arc::clone(&converting);
        move |event: &ProgressEvent| {
            if event.stage == BatchState::Converting
                && converting.fetch_add(1, Ordering::SeqCst) + 1 == 2
            {
                token.cancel();
            }
        }
    };
    let config = config()
        .max_concurrent_downloads(1)
        .progress(Arc::new(sink))
        .build()
        .unwrap();
    let cdn = Arc::new(FakeCdn::healthy(5));
    let store = Arc::new(MemoryStore::default());
    let pipeline = ChapterPipeline::new(config, cdn.clone())
        .with_store(store.clone())
        .with_cancellation(token.clone());

    let report = pipeline.process_chapter(&chapter("c1", 5)).await.unwrap();

    assert_eq!(report.outcome, BatchOutcome::Cancelled);
    assert_eq!(report.stats.converted, 2);
    assert_eq!(cdn.total_calls(), 2);
    assert!(report.pages[2..]
        .iter()
        .all(|p| p.error == Some(PageError::Cancelled { index: p.index })));

    assert!(store.documents.lock().unwrap().is_empty());
    assert_eq!(store.outcomes.lock().unwrap()[0].state, BatchState::Cancelled);
}

#[tokio::test]
async fn test_integrity_failure_exhausts_every_budget() {
    init_tracing();
    let encoder = Arc::new(TruncatingEncoder::default());
    let config = config()
        .max_assembly_retries(2)
        .max_batch_retries(1)
        .build()
        .unwrap();
    let store = Arc::new(MemoryStore::default());
    let pipeline = ChapterPipeline::new(config, Arc::new(FakeCdn::healthy(2)))
        .with_encoder(encoder.clone())
        .with_store(store.clone());

    let report = pipeline.process_chapter(&chapter("c1", 2)).await.unwrap();

    let BatchOutcome::Failed { error } = &report.outcome else {
        panic!("expected Failed, got {:?}", report.state());
    };
    assert!(
        matches!(error, BatchError::AllAttemptsExhausted { attempts: 2, last_error } if last_error.contains("%%EOF")),
        "got {error}"
    );
    assert_eq!(encoder.calls.load(Ordering::SeqCst), 6);
    assert_eq!(report.stats.batch_attempts, 2);
    assert_eq!(report.stats.assembly_retries, 4);
    assert!(store.documents.lock().unwrap().is_empty());
    assert_eq!(store.outcomes.lock().unwrap()[0].state, BatchState::Failed);
}

// ── Concurrency and ordering ────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetches_respect_limit() {
    let mut cdn = FakeCdn::default();
    for i in 0..12 {
        cdn = cdn.with(i, Reply::Image { index: i, delay_ms: 20 });
    }
    let cdn = Arc::new(cdn);
    let config = config().max_concurrent_downloads(3).build().unwrap();
    let pipeline = ChapterPipeline::new(config, cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 12)).await.unwrap();

    assert!(report.outcome.is_done());
    assert!(cdn.max_in_flight() <= 3, "saw {}", cdn.max_in_flight());
    assert!(cdn.max_in_flight() >= 1);
}

#[tokio::test]
async fn test_page_order_follows_sequence_not_completion() {
    let mut cdn = FakeCdn::default();
    for i in 0..5 {
        let delay_ms = (5 - i as u64) * 15;
        cdn = cdn.with(i, Reply::Image { index: i, delay_ms });
    }
    let config = config().max_concurrent_downloads(5).build().unwrap();
    let pipeline = ChapterPipeline::new(config, Arc::new(cdn));

    let report = pipeline.process_chapter(&chapter("c1", 5)).await.unwrap();

    let document = report.outcome.document().unwrap();
    assert_eq!(document.page_indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(page_image_widths(&document.bytes), vec![20, 21, 22, 23, 24]);
}

#[tokio::test]
async fn test_identical_input_yields_identical_bytes() {
    let config = config().build().unwrap();
    let first = ChapterPipeline::new(config.clone(), Arc::new(FakeCdn::healthy(3)))
        .process_chapter(&chapter("c1", 3))
        .await
        .unwrap();
    let second = ChapterPipeline::new(config, Arc::new(FakeCdn::healthy(3)))
        .process_chapter(&chapter("c1", 3))
        .await
        .unwrap();

    assert_eq!(
        first.outcome.document().unwrap().bytes,
        second.outcome.document().unwrap().bytes
    );
}

// ── Retry behaviour ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_transient_fetch_errors_are_retried() {
    let cdn = Arc::new(FakeCdn::healthy(3).with(1, Reply::Flaky { index: 1, failures: 2 }));
    let config = config().max_fetch_retries(3).build().unwrap();
    let pipeline = ChapterPipeline::new(config, cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    assert!(report.outcome.is_done());
    assert_eq!(cdn.calls(1), 3);
    assert_eq!(report.pages[1].attempts, 3);
    assert_eq!(report.stats.fetch_retries, 2);
}

#[tokio::test]
async fn test_exhausted_fetch_leaves_a_gap() {
    let cdn = Arc::new(FakeCdn::healthy(3).with(0, Reply::Status(500)));
    let config = config().max_fetch_retries(1).build().unwrap();
    let pipeline = ChapterPipeline::new(config, cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    let BatchOutcome::PartialFailure { document, failed } = &report.outcome else {
        panic!("expected PartialFailure, got {:?}", report.state());
    };
    assert_eq!(document.page_indices, vec![1, 2]);
    match &failed[..] {
        [PageError::Fetch { index: 0, source }] => {
            assert_eq!(source.attempts, 2);
            assert_eq!(source.kind, FetchErrorKind::HttpStatus(500));
        }
        other => panic!("unexpected failures: {other:?}"),
    }
    assert_eq!(cdn.calls(0), 2);
}

#[tokio::test]
async fn test_fail_policy_retries_partial_batches() {
    let cdn = Arc::new(FakeCdn::healthy(3).with(1, Reply::Raw(vec![0u8; 16])));
    let config = config()
        .partial_policy(PartialPolicy::Fail)
        .max_batch_retries(1)
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    assert!(matches!(
        report.outcome,
        BatchOutcome::Failed {
            error: BatchError::AllAttemptsExhausted { attempts: 2, .. }
        }
    ));
    assert_eq!(report.stats.batch_attempts, 2);
    assert_eq!(cdn.calls(1), 2);
    assert_eq!(cdn.calls(0), 2);
}

#[tokio::test]
async fn test_retry_policy_reports_partial_after_exhaustion() {
    let cdn = Arc::new(FakeCdn::healthy(3).with(2, Reply::Status(404)));
    let config = config()
        .partial_policy(PartialPolicy::Retry)
        .max_fetch_retries(0)
        .max_batch_retries(2)
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, cdn.clone());

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    assert_eq!(report.state(), BatchState::PartialFailure);
    assert_eq!(report.stats.batch_attempts, 3);
    assert_eq!(cdn.calls(2), 3);
    assert_eq!(report.failed_indices(), vec![2]);
}

#[tokio::test]
async fn test_crashed_worker_is_not_reported_as_cancelled() {
    init_tracing();
    let cdn = Arc::new(FakeCdn::healthy(3).with(1, Reply::Panic));
    let pipeline = ChapterPipeline::new(config().build().unwrap(), cdn);

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    let BatchOutcome::PartialFailure { document, failed } = &report.outcome else {
        panic!("expected PartialFailure, got {:?}", report.state());
    };
    assert_eq!(document.page_indices, vec![0, 2]);
    assert!(
        matches!(
            failed.as_slice(),
            [PageError::WorkerPanicked { index: 1, detail }] if detail.contains("CDN blew up")
        ),
        "got {failed:?}"
    );
    assert_eq!(report.pages[1].status, TaskStatus::Failed);
    assert_eq!(report.pages[0].status, TaskStatus::Converted);
}

#[tokio::test]
async fn test_no_usable_pages_fails_the_batch() {
    let cdn = Arc::new(FakeCdn::default());
    let config = config()
        .max_fetch_retries(0)
        .max_batch_retries(0)
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, cdn);

    let report = pipeline.process_chapter(&chapter("c1", 2)).await.unwrap();

    assert_eq!(
        report.outcome,
        BatchOutcome::Failed {
            error: BatchError::NoUsablePages { total: 2 }
        }
    );
    assert_eq!(report.stats.failed, 2);
}

// ── Deadlines ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_timeout_fails_unfinished_pages() {
    init_tracing();
    let cdn = Arc::new(FakeCdn::healthy(3).with(1, Reply::Image { index: 1, delay_ms: 400 }));
    let config = config()
        .max_concurrent_downloads(3)
        .batch_timeout_ms(100)
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, cdn);

    let report = pipeline.process_chapter(&chapter("c1", 3)).await.unwrap();

    let BatchOutcome::PartialFailure { document, failed } = &report.outcome else {
        panic!("expected PartialFailure, got {:?}", report.state());
    };
    assert_eq!(document.page_indices, vec![0, 2]);
    assert_eq!(failed, &vec![PageError::BatchTimeout { index: 1 }]);
}

// ── Progress, storage and multi-chapter runs ────────────────────────────────

#[tokio::test]
async fn test_progress_walks_through_every_stage() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let seen = Arc::clone(&seen);
        move |event: &ProgressEvent| seen.lock().unwrap().push(event.stage)
    };
    let config = config().progress(Arc::new(sink)).build().unwrap();
    let pipeline = ChapterPipeline::new(config, Arc::new(FakeCdn::healthy(2)));

    pipeline.process_chapter(&chapter("c1", 2)).await.unwrap();

    let seen = seen.lock().unwrap();
    for stage in [
        BatchState::Pending,
        BatchState::Fetching,
        BatchState::Converting,
        BatchState::Assembling,
        BatchState::Verifying,
        BatchState::Done,
    ] {
        assert!(seen.contains(&stage), "missing {stage} in {seen:?}");
    }
    assert_eq!(seen.first(), Some(&BatchState::Pending));
    assert_eq!(seen.last(), Some(&BatchState::Done));
}

#[tokio::test]
async fn test_file_store_writes_pdf_and_outcome_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path()));
    let pipeline = ChapterPipeline::new(config().build().unwrap(), Arc::new(FakeCdn::healthy(2)))
        .with_store(store.clone());

    let report = pipeline.process_chapter(&chapter("c1", 2)).await.unwrap();

    let written = std::fs::read(dir.path().join("Night_Market_Chapter_7.pdf")).unwrap();
    assert_eq!(written, report.outcome.document().unwrap().bytes);

    let log = std::fs::read_to_string(store.outcomes_path()).unwrap();
    let line: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(line["chapter_id"], "c1");
    assert_eq!(line["state"], "Done");
    assert_eq!(line["pages_included"], 2);
}

#[tokio::test]
async fn test_failed_chapter_does_not_stop_the_run() {
    let cdn = Arc::new(FakeCdn::healthy(2));
    let config = config()
        .max_fetch_retries(0)
        .max_batch_retries(0)
        .build()
        .unwrap();
    let pipeline = ChapterPipeline::new(config, cdn);

    let broken = Chapter::new(
        "broken",
        vec!["https://cdn.test/missing/0.png".into()],
        metadata(),
    );
    let reports = pipeline
        .process_chapters(&[broken, chapter("good", 2)])
        .await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].as_ref().unwrap().state(), BatchState::Failed);
    assert_eq!(reports[1].as_ref().unwrap().state(), BatchState::Done);
}
