//! Data carried through the pipeline: chapters in, pages through, documents out.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Descriptive metadata of a chapter, embedded into the assembled document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMetadata {
    /// Title of the series the chapter belongs to.
    pub title: String,
    pub authors: Vec<String>,
    /// Chapter number as published ("12", "12.5", "Extra").
    pub chapter_number: String,
    /// Translation language code, e.g. "en".
    pub language: Option<String>,
    pub tags: Vec<String>,
}

impl ChapterMetadata {
    pub fn new(title: impl Into<String>, chapter_number: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            chapter_number: chapter_number.into(),
            ..Default::default()
        }
    }

    pub fn with_authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// "Title - Chapter N", the document title.
    pub fn document_title(&self) -> String {
        format!("{} - Chapter {}", self.title, self.chapter_number)
    }
}

/// One chapter to download: an id, its pages in reading order, and metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub image_urls: Vec<String>,
    pub metadata: ChapterMetadata,
}

impl Chapter {
    pub fn new(id: impl Into<String>, image_urls: Vec<String>, metadata: ChapterMetadata) -> Self {
        Self {
            id: id.into(),
            image_urls,
            metadata,
        }
    }
}

/// Per-image state inside one batch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Fetched,
    Rejected,
    Converted,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected | TaskStatus::Converted | TaskStatus::Failed
        )
    }
}

/// An image scheduled for download. The index fixes its page position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub url: String,
    pub index: usize,
    pub status: TaskStatus,
}

impl ImageTask {
    pub fn new(index: usize, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index,
            status: TaskStatus::Pending,
        }
    }

    /// Move to `next` if the transition is allowed; returns whether it was.
    ///
    /// `Pending -> Fetched -> {Rejected, Converted, Failed}`. A task may also
    /// fail straight from `Pending`. Terminal states never change.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        let allowed = match (self.status, next) {
            (TaskStatus::Pending, TaskStatus::Fetched | TaskStatus::Failed) => true,
            (TaskStatus::Fetched, s) => s.is_terminal(),
            _ => false,
        };
        if allowed {
            self.status = next;
        }
        allowed
    }
}

/// Bytes returned by a content source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBytes {
    pub data: Vec<u8>,
    /// Length announced by the transport (e.g. `Content-Length`), if any.
    pub declared_len: Option<u64>,
}

impl From<Vec<u8>> for ImageBytes {
    fn from(data: Vec<u8>) -> Self {
        Self {
            data,
            declared_len: None,
        }
    }
}

/// Raster formats the quality gate recognises by signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageFormatKind {
    Png,
    Jpeg,
    Gif,
    WebP,
}

impl ImageFormatKind {
    /// Identify the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some(ImageFormatKind::Png)
        } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some(ImageFormatKind::Jpeg)
        } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
            Some(ImageFormatKind::Gif)
        } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
            Some(ImageFormatKind::WebP)
        } else {
            None
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            ImageFormatKind::Png => image::ImageFormat::Png,
            ImageFormatKind::Jpeg => image::ImageFormat::Jpeg,
            ImageFormatKind::Gif => image::ImageFormat::Gif,
            ImageFormatKind::WebP => image::ImageFormat::WebP,
        }
    }
}

impl fmt::Display for ImageFormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageFormatKind::Png => "png",
            ImageFormatKind::Jpeg => "jpeg",
            ImageFormatKind::Gif => "gif",
            ImageFormatKind::WebP => "webp",
        };
        f.write_str(s)
    }
}

/// A downloaded image before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub index: usize,
    pub bytes: Vec<u8>,
    pub declared_len: Option<u64>,
    /// Format identified from the leading bytes, `None` if unrecognised.
    pub signature: Option<ImageFormatKind>,
}

impl RawImage {
    pub fn new(index: usize, payload: ImageBytes) -> Self {
        let signature = ImageFormatKind::sniff(&payload.data);
        Self {
            index,
            bytes: payload.data,
            declared_len: payload.declared_len,
            signature,
        }
    }
}

/// A validated page in canonical (PNG) form, ready for assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPage {
    pub index: usize,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// An assembled, verified document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub bytes: Vec<u8>,
    /// Sequence indices in page order.
    pub page_indices: Vec<usize>,
    pub metadata: ChapterMetadata,
}

impl Document {
    pub fn page_count(&self) -> usize {
        self.page_indices.len()
    }
}
