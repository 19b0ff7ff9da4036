//! The persisted collaborators' contracts and the
//! batch-shaping logic (dedup + size splitting) shared by any `RecordStore`
//! implementation.

pub mod sqlite;

use crate::error::Result;
use crate::record::HttpRequest;
use std::collections::HashSet;

/// The underlying store bounds bound-parameter count per statement; with
/// ~36 columns this keeps a sub-batch's total parameters comfortably under
/// typical embedded-store limits
pub const MAX_RECORDS_PER_BATCH: usize = 500;

/// Outcome of a `create_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows actually inserted (excludes in-batch duplicates and rows that
    /// lost an `ON CONFLICT` race against an existing row).
    pub inserted: usize,
    /// Rows dropped, either as in-batch duplicates or as pre-existing
    /// conflicts.
    pub skipped: usize,
}

/// Durable batch insertion with deduplication
///
/// Implementations must honor: empty batch succeeds trivially; in-batch
/// dedup by `request_hash` preserving first occurrence; size-splitting into
/// sub-batches of at most `MAX_RECORDS_PER_BATCH`; `ON CONFLICT(request_hash)
/// DO NOTHING` semantics with no per-row retry; all-or-nothing success (a
/// sub-batch failure fails the whole call, never partially reported).
pub trait RecordStore: Send + Sync {
    /// Number of rows currently stored. Used for empty-store (first-load)
    /// detection at startup.
    fn count(&self) -> Result<i64>;

    fn create_batch(&self, records: &[HttpRequest]) -> Result<BatchOutcome>;

    /// Called by a `SourceProcessor` once it reaches EOF on its very first
    /// read. Idempotent; only the first call has any effect
    fn disable_first_load_mode(&self);

    /// Count of existing records for a given source, used by
    /// `apply_initial_import_limit` to detect "resuming" vs "initializing"
    ///
    fn count_for_source(&self, source_name: &str) -> Result<i64>;
}

/// Scan records preserving first occurrence per `request_hash`; drop
/// duplicates silently
pub fn dedup_by_hash(records: &[HttpRequest]) -> Vec<HttpRequest> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(record.request_hash.clone()) {
            out.push(record.clone());
        }
    }
    out
}

/// Split into sub-batches of at most `MAX_RECORDS_PER_BATCH`
pub fn split_batches(records: &[HttpRequest]) -> impl Iterator<Item = &[HttpRequest]> {
    records.chunks(MAX_RECORDS_PER_BATCH.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(hash: &str) -> HttpRequest {
        let event = crate::parser::ParsedEvent {
            timestamp_unix: 1,
            client_ip: "1.1.1.1".into(),
            method: "GET".into(),
            path: "/".into(),
            ..Default::default()
        };
        let mut record = event.to_record("src");
        record.request_hash = hash.to_string();
        record
    }

    #[test]
    fn dedup_preserves_first_occurrence() {
        let records = vec![sample("a"), sample("b"), sample("a")];
        let deduped = dedup_by_hash(&records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].request_hash, "a");
        assert_eq!(deduped[1].request_hash, "b");
    }

    #[test]
    fn split_batches_respects_cap() {
        let records: Vec<_> = (0..1234).map(|i| sample(&i.to_string())).collect();
        let chunks: Vec<_> = split_batches(&records).collect();
        assert_eq!(chunks.len(), 3); // 500 + 500 + 234
        assert_eq!(chunks[0].len(), MAX_RECORDS_PER_BATCH);
        assert_eq!(chunks.last().unwrap().len(), 234);
    }
}
