//! `LogSource`: one tracked file, and the registry that persists it

use serde::{Deserialize, Serialize};

/// One tracked log file and its parser assignment.
///
/// Mutated only by its owning `SourceProcessor`, via the registry's
/// `update_tracking` contract
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSource {
    /// Unique, derived from path.
    pub name: String,
    pub path: String,
    pub parser_type: String,

    /// Byte offset into the file of the next unread byte.
    pub last_position: u64,

    /// Platform file identity; 0 if unavailable.
    pub last_inode: u64,

    /// Last <=100 chars of the last committed line. Diagnostic only.
    pub last_line_tail: String,

    /// Unix seconds of the last successful read, 0 if never read.
    pub last_read_at: i64,
}

impl LogSource {
    pub fn new(name: impl Into<String>, path: impl Into<String>, parser_type: impl Into<String>) -> Self {
        LogSource {
            name: name.into(),
            path: path.into(),
            parser_type: parser_type.into(),
            last_position: 0,
            last_inode: 0,
            last_line_tail: String::new(),
            last_read_at: 0,
        }
    }
}

/// Persisted collaborator owning the set of tracked sources
///
/// Implementations must make `update_tracking` atomic per row; the registry
/// write is idempotent and last-writer-wins
pub trait SourceRegistry: Send + Sync {
    /// Return every currently-registered source.
    fn find_all(&self) -> crate::error::Result<Vec<LogSource>>;

    /// Atomically update one source's tracking triple.
    fn update_tracking(
        &self,
        name: &str,
        position: u64,
        inode: u64,
        tail: &str,
    ) -> crate::error::Result<()>;

    /// Insert or replace a source (used by discovery / tests). Not required
    /// to be idempotent across calls with differing `parser_type`/`path`.
    fn upsert(&self, source: &LogSource) -> crate::error::Result<()>;

    /// Remove a source by name. No-op if absent.
    fn remove(&self, name: &str) -> crate::error::Result<()>;
}
