//! Normalizer: bring every accepted image into canonical PNG form.
//!
//! PNG is lossless, so re-encoding JPEG/GIF/WebP input changes neither the
//! dimensions nor the decoded pixel values. PNG input is still fully decoded
//! (a header can be intact while the pixel data is not) but its original
//! bytes are kept to avoid a pointless re-encode.

use crate::error::ConversionError;
use crate::model::{ImageFormatKind, NormalizedPage, RawImage};
use image::ImageFormat;
use std::io::Cursor;
use tracing::debug;

/// Convert `raw` (already identified as `format`) into a [`NormalizedPage`].
pub fn normalize(raw: &RawImage, format: ImageFormatKind) -> Result<NormalizedPage, ConversionError> {
    let img = image::load_from_memory_with_format(&raw.bytes, format.image_format()).map_err(
        |e| ConversionError::CorruptPayload {
            detail: e.to_string(),
        },
    )?;

    let (width, height) = (img.width(), img.height());

    let png = if format == ImageFormatKind::Png {
        raw.bytes.clone()
    } else {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| ConversionError::CorruptPayload {
                detail: format!("PNG re-encode failed: {e}"),
            })?;
        buf
    };

    debug!(
        "Page {}: normalised {} {}x{} → {} bytes PNG",
        raw.index,
        format,
        width,
        height,
        png.len()
    );

    Ok(NormalizedPage {
        index: raw.index,
        png,
        width,
        height,
    })
}
