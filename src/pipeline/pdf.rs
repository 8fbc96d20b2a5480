//! PDF writer: one image per page, Deflate-compressed, with an Info dictionary.
//!
//! Pages are written as image XObjects holding raw 8-bit samples under
//! `FlateDecode`, which keeps the canonical PNG pixels bit-exact (PDF has no
//! native PNG container). Each image is scaled to fit its page and centred.
//!
//! Output is deterministic: no timestamps or random IDs are written, so the
//! same pages and metadata always produce the same bytes.

use crate::config::PageSize;
use crate::error::AssemblyError;
use crate::model::{ChapterMetadata, NormalizedPage};
use crate::pipeline::assemble::DocumentEncoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{ColorType, DynamicImage, ImageFormat};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, Stream, StringFormat};
use std::io::Write;
use tracing::debug;

/// The default [`DocumentEncoder`], built on `lopdf`.
#[derive(Debug, Clone)]
pub struct PdfEncoder {
    creator: String,
    compression: Compression,
}

impl Default for PdfEncoder {
    fn default() -> Self {
        Self {
            creator: env!("CARGO_PKG_NAME").to_string(),
            compression: Compression::default(),
        }
    }
}

impl PdfEncoder {
    /// Value written to the Info dictionary's `Creator` entry.
    pub fn with_creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    /// zlib level for image data (0–9).
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    fn image_xobject(&self, page: &NormalizedPage) -> Result<Stream, AssemblyError> {
        let img = image::load_from_memory_with_format(&page.png, ImageFormat::Png).map_err(|e| {
            AssemblyError::EncodingFailure(format!("page {}: {e}", page.index))
        })?;
        let (samples, color_space) = flatten(&img);

        let deflate_err =
            |e: std::io::Error| AssemblyError::EncodingFailure(format!("page {}: deflate: {e}", page.index));
        let mut enc = ZlibEncoder::new(Vec::with_capacity(samples.len() / 2), self.compression);
        enc.write_all(&samples).map_err(deflate_err)?;
        let data = enc.finish().map_err(deflate_err)?;

        Ok(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => Object::Integer(img.width() as i64),
                "Height" => Object::Integer(img.height() as i64),
                "ColorSpace" => color_space,
                "BitsPerComponent" => Object::Integer(8),
                "Filter" => "FlateDecode",
            },
            data,
        ))
    }
}

impl DocumentEncoder for PdfEncoder {
    fn encode(
        &self,
        pages: &[NormalizedPage],
        metadata: &ChapterMetadata,
        page_size: PageSize,
    ) -> Result<Vec<u8>, AssemblyError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::with_capacity(pages.len());

        for page in pages {
            let image_id = doc.add_object(self.image_xobject(page)?);

            let (page_w, page_h) = page_size.dimensions(page.width, page.height);
            let (x, y, w, h) = fit_centered(page.width, page.height, page_w, page_h);
            let content = Content {
                operations: vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![
                            Object::Real(w),
                            Object::Integer(0),
                            Object::Integer(0),
                            Object::Real(h),
                            Object::Real(x),
                            Object::Real(y),
                        ],
                    ),
                    Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                    Operation::new("Q", vec![]),
                ],
            };
            let content_bytes = content
                .encode()
                .map_err(|e| AssemblyError::EncodingFailure(format!("page {}: {e}", page.index)))?;
            let content_id = doc.add_object(Stream::new(Dictionary::new(), content_bytes));

            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Real(page_w),
                    Object::Real(page_h),
                ],
                "Contents" => content_id,
                "Resources" => dictionary! {
                    "XObject" => dictionary! { "Im0" => image_id },
                },
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => Object::Integer(count),
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        // Metadata goes in once the page tree is complete.
        let info_id = doc.add_object(info_dictionary(metadata, &self.creator));
        doc.trailer.set("Info", info_id);

        let mut out = Vec::new();
        doc.save_to(&mut out)
            .map_err(|e| AssemblyError::EncodingFailure(format!("write: {e}")))?;
        debug!("Encoded {} page(s) → {} bytes PDF", count, out.len());
        Ok(out)
    }
}

/// Info dictionary entries for a chapter.
fn info_dictionary(meta: &ChapterMetadata, creator: &str) -> Dictionary {
    let mut keywords = vec!["Manga".to_string(), meta.title.clone()];
    keywords.extend(meta.tags.iter().cloned());

    let mut info = dictionary! {
        "Title" => text_string(&meta.document_title()),
        "Author" => text_string(&meta.authors.join(", ")),
        "Subject" => text_string(&format!("Chapter {}", meta.chapter_number)),
        "Keywords" => text_string(&keywords.join(", ")),
        "Creator" => text_string(creator),
        "Producer" => text_string(concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"))),
    };
    if let Some(ref lang) = meta.language {
        info.set("Language", text_string(lang));
    }
    info
}

/// PDF text string: literal for ASCII, UTF-16BE with BOM otherwise.
fn text_string(s: &str) -> Object {
    if s.is_ascii() {
        Object::string_literal(s)
    } else {
        let mut bytes = vec![0xFE, 0xFF];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

/// 8-bit samples plus colour space. Alpha is composited onto white.
fn flatten(img: &DynamicImage) -> (Vec<u8>, &'static str) {
    match img.color() {
        ColorType::L8 | ColorType::L16 => (img.to_luma8().into_raw(), "DeviceGray"),
        ColorType::La8 | ColorType::La16 => {
            let samples = img
                .to_luma_alpha8()
                .pixels()
                .map(|p| over_white(p.0[0], p.0[1]))
                .collect();
            (samples, "DeviceGray")
        }
        c if c.has_alpha() => {
            let rgba = img.to_rgba8();
            let mut samples = Vec::with_capacity(rgba.len() / 4 * 3);
            for p in rgba.pixels() {
                let [r, g, b, a] = p.0;
                samples.extend_from_slice(&[over_white(r, a), over_white(g, a), over_white(b, a)]);
            }
            (samples, "DeviceRGB")
        }
        _ => (img.to_rgb8().into_raw(), "DeviceRGB"),
    }
}

fn over_white(value: u8, alpha: u8) -> u8 {
    let (v, a) = (value as u32, alpha as u32);
    ((v * a + 255 * (255 - a) + 127) / 255) as u8
}

/// Largest centred rectangle with the image's aspect ratio inside the page.
/// Returns `(x, y, width, height)` in points.
fn fit_centered(img_w: u32, img_h: u32, page_w: f32, page_h: f32) -> (f32, f32, f32, f32) {
    let (iw, ih) = (img_w.max(1) as f32, img_h.max(1) as f32);
    let scale = (page_w / iw).min(page_h / ih);
    let (w, h) = (iw * scale, ih * scale);
    ((page_w - w) / 2.0, (page_h - h) / 2.0, w, h)
}
