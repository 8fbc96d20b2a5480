//! Pipeline stages for chapter-to-PDF assembly.
//!
//! Each submodule implements exactly one step. Stages are plain functions or
//! small structs with no knowledge of batches; [`crate::batch`] wires them
//! together and owns concurrency, deadlines and batch-level retry.
//!
//! ## Data Flow
//!
//! ```text
//! fetch ──▶ quality ──▶ normalize ──▶ assemble ──▶ verify
//! (HTTP)    (gate)      (→ PNG)       (lopdf)      (%PDF- … %%EOF)
//! ```
//!
//! 1. [`fetch`]:     download one image with per-attempt timeout and retry;
//!    the only stage with network I/O
//! 2. [`quality`]:   size, signature and header checks before decoding
//! 3. [`normalize`]: decode and bring every page into PNG form
//! 4. [`assemble`]:  order pages and encode the document on the blocking
//!    pool, retrying on timeout, encoder error or failed verification
//! 5. [`verify`]:    structural marker check of the encoded bytes
//!
//! [`pdf`] holds the default [`assemble::DocumentEncoder`].

pub mod assemble;
pub mod fetch;
pub mod normalize;
pub mod pdf;
pub mod quality;
pub mod verify;
