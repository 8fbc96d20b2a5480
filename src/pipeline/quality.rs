//! QualityGate: cheap structural checks before any pixel is decoded.
//!
//! Image servers answer failed lookups with tiny placeholders, HTML error
//! pages, or truncated bodies that still carry a 200 status. Checking size,
//! signature and the header-declared dimensions catches all of those
//! without decoding the full image.

use crate::error::QualityRejection;
use crate::model::{ImageFormatKind, RawImage};
use std::io::Cursor;

/// Limits applied by [`check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityThresholds {
    pub min_bytes: usize,
    pub min_dimension: u32,
}

/// Accept or reject `raw`. On acceptance returns the detected format.
pub fn check(
    raw: &RawImage,
    thresholds: &QualityThresholds,
) -> Result<ImageFormatKind, QualityRejection> {
    if let Some(declared) = raw.declared_len {
        if declared != raw.bytes.len() as u64 {
            return Err(QualityRejection::Truncated {
                declared,
                received: raw.bytes.len(),
            });
        }
    }

    if raw.bytes.len() < thresholds.min_bytes {
        return Err(QualityRejection::TooSmall {
            len: raw.bytes.len(),
            min: thresholds.min_bytes,
        });
    }

    let format = raw.signature.ok_or_else(|| QualityRejection::BadSignature {
        magic: raw.bytes.iter().take(8).copied().collect(),
    })?;

    let (width, height) = image::ImageReader::with_format(Cursor::new(&raw.bytes), format.image_format())
        .into_dimensions()
        .map_err(|e| QualityRejection::Corrupt {
            detail: e.to_string(),
        })?;

    if width < thresholds.min_dimension || height < thresholds.min_dimension {
        return Err(QualityRejection::Undersized {
            width,
            height,
            min: thresholds.min_dimension,
        });
    }

    Ok(format)
}
