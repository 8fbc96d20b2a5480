//! IntegrityVerifier: structural check of an assembled PDF.
//!
//! Only the markers are inspected. A document that starts with `%PDF-` and
//! carries `%%EOF` near its end was at least written to completion; this
//! catches truncated writes and encoders that died half-way, not content
//! errors.

use crate::error::IntegrityError;

/// Canonical start marker.
pub const HEADER: &[u8] = b"%PDF-";

/// Canonical end-of-file marker.
pub const TRAILER: &[u8] = b"%%EOF";

/// How far from the end the trailer may sit. Writers append a newline or
/// two after `%%EOF`, and incremental updates may add a little more.
pub const TRAILER_WINDOW: usize = 2048;

/// Verify the start and end markers of `bytes`.
pub fn verify(bytes: &[u8]) -> Result<(), IntegrityError> {
    if !bytes.starts_with(HEADER) {
        return Err(IntegrityError::MissingHeader);
    }
    let tail = &bytes[bytes.len().saturating_sub(TRAILER_WINDOW)..];
    if !tail.windows(TRAILER.len()).any(|w| w == TRAILER) {
        return Err(IntegrityError::MissingTrailer);
    }
    Ok(())
}
