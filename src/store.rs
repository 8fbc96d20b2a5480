//! Persistence of finished documents and batch outcomes.
//!
//! The pipeline hands every `Done`/`PartialFailure` document to a
//! [`DocumentStore`] and records every terminal status through it. The
//! bundled [`FileStore`] writes into a single directory:
//!
//! ```text
//! out/
//!  ├─ One_Piece_Chapter_1044.pdf
//!  ├─ One_Piece_Chapter_1045.pdf
//!  └─ outcomes.jsonl      one BatchStatus per line
//! ```

use crate::error::ChapterPdfError;
use crate::model::{ChapterMetadata, Document};
use crate::output::BatchStatus;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// File the outcome log is appended to.
pub const OUTCOMES_FILE: &str = "outcomes.jsonl";

/// Runs of path-hostile characters, whitespace and underscores.
static RE_UNSAFE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1F\s_]+"#).unwrap());

/// Receives finished documents and terminal batch statuses.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn store_document(
        &self,
        chapter_id: &str,
        document: &Document,
        metadata: &ChapterMetadata,
    ) -> Result<(), ChapterPdfError>;

    async fn record_outcome(
        &self,
        chapter_id: &str,
        status: &BatchStatus,
    ) -> Result<(), ChapterPdfError>;
}

/// `"<title>_Chapter_<n>.pdf"` with path-hostile characters removed.
pub fn document_file_name(metadata: &ChapterMetadata) -> String {
    let raw = format!("{}_Chapter_{}", metadata.title, metadata.chapter_number);
    let cleaned = RE_UNSAFE.replace_all(raw.trim(), "_");
    let stem = cleaned.trim_matches(|c| c == '.' || c == '_');
    if stem.is_empty() {
        "chapter.pdf".to_string()
    } else {
        format!("{stem}.pdf")
    }
}

/// A [`DocumentStore`] backed by one output directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    /// Serialises appends to the outcome log.
    log: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            log: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the document for `metadata` ends up.
    pub fn document_path(&self, metadata: &ChapterMetadata) -> PathBuf {
        self.dir.join(document_file_name(metadata))
    }

    pub fn outcomes_path(&self) -> PathBuf {
        self.dir.join(OUTCOMES_FILE)
    }

    async fn ensure_dir(&self) -> Result<(), ChapterPdfError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ChapterPdfError::OutputWriteFailed {
                path: self.dir.clone(),
                source: e,
            })
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn store_document(
        &self,
        chapter_id: &str,
        document: &Document,
        metadata: &ChapterMetadata,
    ) -> Result<(), ChapterPdfError> {
        self.ensure_dir().await?;
        let path = self.document_path(metadata);
        let dir = self.dir.clone();
        let bytes = document.bytes.clone();

        // Atomic write: temp file in the target directory, then rename over
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".chapter-")
                .suffix(".pdf.tmp")
                .tempfile_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| ChapterPdfError::Internal(format!("store task failed: {e}")))?
        .map_err(|e| ChapterPdfError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        })?;

        info!(
            "Chapter '{}': wrote {} ({} bytes)",
            chapter_id,
            path.display(),
            document.bytes.len()
        );
        Ok(())
    }

    async fn record_outcome(
        &self,
        chapter_id: &str,
        status: &BatchStatus,
    ) -> Result<(), ChapterPdfError> {
        self.ensure_dir().await?;
        let path = self.outcomes_path();
        let mut line = serde_json::to_string(status)
            .map_err(|e| ChapterPdfError::Internal(format!("serialise outcome: {e}")))?;
        line.push('\n');

        let write_err = |e| ChapterPdfError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        };
        let _guard = self.log.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(write_err)?;
        file.write_all(line.as_bytes()).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        debug!("Chapter '{}': recorded outcome {}", chapter_id, status.state);
        Ok(())
    }
}
