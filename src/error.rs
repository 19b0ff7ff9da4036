//! Crate-boundary error type.
//!
//! Per-line failures (parse rejection, enrichment failure, a backward
//! checkpoint) are never surfaced as `Err` — they are logged and swallowed
//! at the point of occurrence, matching the processor's "never propagate
//! upward" contract. `IngestError` exists only for the handful of places a
//! caller genuinely needs to observe a failure: store and registry I/O, and
//! non-recoverable reader errors.

use std::io;
use thiserror::Error;

/// Errors that can escape the ingestion pipeline's public API.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The record store (or source registry) could not complete an operation.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// A reader I/O error other than not-found/permission-denied, which the
    /// reader contract treats as recoverable (empty batch, retry later).
    #[error("reader I/O error: {0}")]
    Reader(#[source] io::Error),

    /// A batch write failed; the caller should keep the batch for retry and
    /// must not advance its checkpoint.
    #[error("batch write failed: {0}")]
    BatchWrite(String),
}

/// Convenience alias used throughout the crate's public signatures.
pub type Result<T> = std::result::Result<T, IngestError>;
