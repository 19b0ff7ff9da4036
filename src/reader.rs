//! Tail one file, detecting rotation/truncation, returning line batches with
//! a verifiable file position.
//!
//! Seeks to a saved offset, reads complete lines with a `BufReader`, and only
//! ever hands back a position obtained *after* a complete-line read, so the
//! saved offset is always a line boundary. This crate doesn't own the file —
//! an external process (Traefik) writes and rotates it — so the reader must
//! detect rotation via inode change or truncation instead of performing
//! rotation itself.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::parser::LogParser;

/// A line is rejected (not truncated) once it exceeds this many bytes without
/// a terminating newline. The spec only guarantees lines up to 1 MiB are
/// supported; this bounds worst-case memory for a runaway unterminated write.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Result of one `read_batch` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadBatch {
    pub lines: Vec<String>,
    pub new_position: u64,
    pub new_inode: u64,
    pub new_line_tail: String,
}

/// Tails a single file across rotation/truncation, owned by exactly one
/// `SourceProcessor`
#[derive(Debug)]
pub struct IncrementalReader {
    path: PathBuf,
    last_position: u64,
    last_inode: u64,
    last_line_tail: String,
}

impl IncrementalReader {
    pub fn new(path: impl Into<PathBuf>, last_position: u64, last_inode: u64, last_line_tail: impl Into<String>) -> Self {
        IncrementalReader {
            path: path.into(),
            last_position,
            last_inode,
            last_line_tail: last_line_tail.into(),
        }
    }

    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    pub fn last_inode(&self) -> u64 {
        self.last_inode
    }

    pub fn last_line_tail(&self) -> &str {
        &self.last_line_tail
    }

    /// Read up to `max_lines` complete newline-terminated lines starting from
    /// the saved position, detecting rotation first.
    ///
    /// Missing file / permission denied is not an error: returns an empty
    /// batch at the unchanged position so the caller retries later.
    pub fn read_batch(&mut self, max_lines: usize) -> io::Result<ReadBatch> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound || e.kind() == io::ErrorKind::PermissionDenied => {
                return Ok(ReadBatch {
                    lines: Vec::new(),
                    new_position: self.last_position,
                    new_inode: self.last_inode,
                    new_line_tail: self.last_line_tail.clone(),
                });
            }
            Err(e) => return Err(e),
        };

        let metadata = file.metadata()?;
        let current_inode = file_identity(&metadata);
        let current_size = metadata.len();

        self.detect_rotation(current_inode, current_size);

        file.seek(SeekFrom::Start(self.last_position))?;
        let mut reader = BufReader::with_capacity(1024 * 1024, file);

        let mut lines = Vec::with_capacity(max_lines.min(1024));
        let mut tail = self.last_line_tail.clone();

        while lines.len() < max_lines {
            let mut buf = Vec::new();
            match read_bounded_line(&mut reader, &mut buf)? {
                LineOutcome::Complete => {
                    // Strip the trailing newline (and a preceding \r for CRLF files).
                    if buf.last() == Some(&b'\n') {
                        buf.pop();
                    }
                    if buf.last() == Some(&b'\r') {
                        buf.pop();
                    }
                    if buf.is_empty() {
                        continue;
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    tail = tail_of(&line);
                    lines.push(line);
                }
                LineOutcome::Eof | LineOutcome::UnterminatedTooLong => break,
            }
        }

        // `stream_position` on a `BufReader` special-cases a zero-offset
        // `seek(Current(0))` to report the logical position without
        // discarding buffered-ahead bytes (unlike seeking on the raw file).
        let new_position = reader.stream_position()?;

        if !lines.is_empty() {
            self.last_position = new_position;
            self.last_inode = current_inode;
            self.last_line_tail = tail.clone();
        }

        Ok(ReadBatch {
            lines,
            new_position,
            new_inode: current_inode,
            new_line_tail: tail,
        })
    }

    /// Detects rotation-by-rename (inode change) or rotation-by-truncate
    /// (current size smaller than the saved position) and resets state.
    fn detect_rotation(&mut self, current_inode: u64, current_size: u64) {
        let inode_changed = self.last_inode != 0 && current_inode != 0 && current_inode != self.last_inode;
        let truncated = current_size < self.last_position;

        if inode_changed || truncated {
            log::info!(
                "rotation detected for {:?} (inode_changed={inode_changed}, truncated={truncated}); resetting position",
                self.path
            );
            self.last_position = 0;
            self.last_line_tail.clear();
        }
    }

    /// Monotonic guard: a commit older than the current position is ignored.
    pub fn update_position(&mut self, pos: u64, inode: u64, tail: &str) {
        if pos < self.last_position {
            log::warn!(
                "ignoring out-of-order checkpoint commit for {:?}: {pos} < {}",
                self.path,
                self.last_position
            );
            return;
        }
        self.last_position = pos;
        self.last_inode = inode;
        self.last_line_tail = tail.to_string();
    }

    pub fn reset(&mut self) {
        self.last_position = 0;
        self.last_inode = 0;
        self.last_line_tail.clear();
    }

    /// Binary search over `[0, size]` for the first line whose parsed
    /// timestamp is `>= cutoff`. Returns file size if every parseable line is
    /// older than `cutoff` (skip the whole file).
    pub fn find_start_by_date(&self, cutoff: i64, parser: &dyn LogParser) -> io::Result<u64> {
        let file = File::open(&self.path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Ok(0);
        }

        let mut lo = 0u64;
        let mut hi = size;
        let mut best = size;
        const MAX_ITERATIONS: u32 = 20;

        for _ in 0..MAX_ITERATIONS {
            if lo >= hi {
                break;
            }
            let probe = lo + (hi - lo) / 2;

            match read_next_complete_line_at_or_after(&self.path, probe)? {
                Some((line_start, line)) => match parser.parse(&line) {
                    Ok(event) if event.timestamp_unix >= cutoff => {
                        best = line_start;
                        if probe == 0 {
                            break;
                        }
                        hi = probe;
                    }
                    _ => {
                        lo = probe + 1;
                    }
                },
                None => break,
            }
        }

        Ok(best)
    }
}

enum LineOutcome {
    Complete,
    Eof,
    UnterminatedTooLong,
}

fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<LineOutcome> {
    loop {
        let available = match reader.fill_buf() {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            // EOF reached, whether or not `buf` holds an unterminated tail —
            // either way there is no complete line to return yet.
            return Ok(LineOutcome::Eof);
        }
        if let Some(pos) = available.iter().position(|&b| b == b'\n') {
            buf.extend_from_slice(&available[..=pos]);
            reader.consume(pos + 1);
            return Ok(LineOutcome::Complete);
        } else {
            let len = available.len();
            buf.extend_from_slice(available);
            reader.consume(len);
            if buf.len() > MAX_LINE_BYTES {
                return Ok(LineOutcome::UnterminatedTooLong);
            }
        }
    }
}

/// Discard the partial line at `probe` (unless `probe == 0`), then read the
/// next complete line. Returns `(start_offset, line)` or `None` at EOF.
fn read_next_complete_line_at_or_after(path: &Path, probe: u64) -> io::Result<Option<(u64, String)>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(probe))?;
    let mut reader = BufReader::new(file);

    if probe != 0 {
        let mut discard = Vec::new();
        match read_bounded_line(&mut reader, &mut discard)? {
            LineOutcome::Complete => {}
            _ => return Ok(None),
        }
    }

    loop {
        let line_start = reader.stream_position()?;
        let mut buf = Vec::new();
        match read_bounded_line(&mut reader, &mut buf)? {
            LineOutcome::Complete => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                if buf.is_empty() {
                    continue;
                }
                return Ok(Some((line_start, String::from_utf8_lossy(&buf).into_owned())));
            }
            _ => return Ok(None),
        }
    }
}

fn tail_of(line: &str) -> String {
    if line.len() <= 100 {
        line.to_string()
    } else {
        let start = line.len() - 100;
        // Step back to a char boundary so we never split a UTF-8 sequence.
        let mut start = start;
        while start < line.len() && !line.is_char_boundary(start) {
            start += 1;
        }
        line[start..].to_string()
    }
}

#[cfg(unix)]
fn file_identity(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn file_identity(_metadata: &std::fs::Metadata) -> u64 {
    0
}
