//! `SourceProcessor`: the per-source run loop.
//!
//! Owns exactly one `IncrementalReader` and drives it through poll → parse →
//! enrich → batch → write → checkpoint. The loop waits on four time sources
//! via `tokio::select!`: a cancellation notification, a poll tick (how often
//! the file is re-read), a resettable flush deadline (how long an
//! accumulating batch may sit before being written regardless of size), and a
//! position-update tick (commits a checkpoint for an already-flushed batch
//! even when no new batch is pending). Parsing and enrichment for one poll's
//! worth of raw lines are fanned out across a small worker pool
//! (`ProcessorConfig::worker_pool_size`) using `tokio::task::JoinSet`.

use crate::config::{ImportLimitConfig, ProcessorConfig};
use crate::enrich::{enrich_record, GeoEnricher, UserAgentClassifier};
use crate::error::IngestError;
use crate::parser::LogParser;
use crate::reader::{IncrementalReader, ReadBatch};
use crate::record::HttpRequest;
use crate::source::{LogSource, SourceRegistry};
use crate::store::RecordStore;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// A checkpoint triple that hasn't yet been durably committed to the
/// registry — it is only safe to commit once the batch it was read alongside
/// has been flushed.
type Checkpoint = (u64, u64, String);

struct Shared {
    name: String,
    path: String,
    initial_position: u64,
    initial_inode: u64,
    initial_tail: String,
    parser: Arc<dyn LogParser>,
    store: Arc<dyn RecordStore>,
    registry: Arc<dyn SourceRegistry>,
    geo: Arc<dyn GeoEnricher>,
    ua: Arc<dyn UserAgentClassifier>,
    config: ProcessorConfig,
    import_limit: ImportLimitConfig,
    state: Mutex<ProcessorState>,
    stop_notify: Notify,
    batches_written: AtomicU64,
    lines_dropped: AtomicU64,
    write_errors: AtomicU64,
}

/// Owns and drives one tracked log file.
pub struct SourceProcessor {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl SourceProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: LogSource,
        parser: Arc<dyn LogParser>,
        store: Arc<dyn RecordStore>,
        registry: Arc<dyn SourceRegistry>,
        geo: Arc<dyn GeoEnricher>,
        ua: Arc<dyn UserAgentClassifier>,
        config: ProcessorConfig,
        import_limit: ImportLimitConfig,
    ) -> Self {
        SourceProcessor {
            shared: Arc::new(Shared {
                name: source.name,
                path: source.path,
                initial_position: source.last_position,
                initial_inode: source.last_inode,
                initial_tail: source.last_line_tail,
                parser,
                store,
                registry,
                geo,
                ua,
                config,
                import_limit,
                state: Mutex::new(ProcessorState::Idle),
                stop_notify: Notify::new(),
                batches_written: AtomicU64::new(0),
                lines_dropped: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
            }),
            handle: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ProcessorState {
        *self.shared.state.lock().unwrap()
    }

    pub fn batches_written(&self) -> u64 {
        self.shared.batches_written.load(Ordering::Relaxed)
    }

    pub fn lines_dropped(&self) -> u64 {
        self.shared.lines_dropped.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.shared.write_errors.load(Ordering::Relaxed)
    }

    /// Spawns the run loop. A no-op if already running.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        *self.shared.state.lock().unwrap() = ProcessorState::Running;
        let shared = self.shared.clone();
        self.handle = Some(tokio::spawn(async move { run(shared).await }));
    }

    /// Signals the run loop to stop and waits for it to finish: it attempts
    /// one last flush, committing the checkpoint only if that flush succeeds
    pub async fn stop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != ProcessorState::Running {
                return;
            }
            *state = ProcessorState::Stopping;
        }
        self.shared.stop_notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// In-memory accumulation state for the run loop: the batch built up across
/// poll cycles, and the checkpoint that will become committable once that
/// batch is durably written.
struct LoopState {
    batch: Vec<HttpRequest>,
    pending_checkpoint: Option<Checkpoint>,
    last_committed: Checkpoint,
    /// True only for a source whose checkpoint sat at byte 0 when this run
    /// loop started (`last_position_on_open == 0` in §4.3 item 1). Cleared
    /// the first time EOF is reached so the "initial load complete" signal
    /// fires at most once, and never fires at all for a source that was
    /// already caught up or mid-backlog from a prior run.
    initial_load_pending: bool,
}

async fn run(shared: Arc<Shared>) {
    let mut reader = IncrementalReader::new(
        shared.path.clone(),
        shared.initial_position,
        shared.initial_inode,
        shared.initial_tail.clone(),
    );
    let last_position_on_open = shared.initial_position;
    if let Err(e) = apply_initial_import_limit(&shared, &mut reader).await {
        log::warn!("initial import limit could not be applied for {}: {e}", shared.name);
    }

    let mut state = LoopState {
        batch: Vec::new(),
        pending_checkpoint: None,
        last_committed: (reader.last_position(), reader.last_inode(), reader.last_line_tail().to_string()),
        initial_load_pending: last_position_on_open == 0,
    };

    let mut poll_timer = tokio::time::interval(shared.config.poll_interval);
    poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut position_timer = tokio::time::interval(shared.config.position_update_interval);
    position_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut flush_deadline: Pin<Box<Sleep>> = Box::pin(tokio::time::sleep(shared.config.batch_timeout));

    loop {
        tokio::select! {
            _ = shared.stop_notify.notified() => break,
            _ = poll_timer.tick() => {
                poll_once(&shared, &mut reader, &mut state).await;
                if state.batch.len() >= shared.config.batch_size {
                    flush(&shared, &mut reader, &mut state).await;
                    flush_deadline.as_mut().reset(Instant::now() + shared.config.batch_timeout);
                }
            }
            _ = &mut flush_deadline => {
                if !state.batch.is_empty() {
                    flush(&shared, &mut reader, &mut state).await;
                }
                flush_deadline.as_mut().reset(Instant::now() + shared.config.batch_timeout);
            }
            _ = position_timer.tick() => {
                commit_pending_if_batch_empty(&shared, &mut reader, &mut state);
            }
        }
    }

    // Shutdown: one last flush attempt. Commit the checkpoint only if it
    // succeeds; otherwise leave it untouched so the next startup re-reads and
    // re-processes the same bytes (deduplicated at the store).
    if !state.batch.is_empty() {
        flush(&shared, &mut reader, &mut state).await;
    } else {
        commit_pending_if_batch_empty(&shared, &mut reader, &mut state);
    }

    *shared.state.lock().unwrap() = ProcessorState::Stopped;
}

/// One poll cycle: read up to the remaining room in the current batch, parse
/// and enrich it off-thread, and append the result to the in-memory batch.
/// Never writes or checkpoints by itself
async fn poll_once(shared: &Arc<Shared>, reader: &mut IncrementalReader, state: &mut LoopState) {
    let remaining = shared.config.batch_size.saturating_sub(state.batch.len());
    if remaining == 0 {
        return;
    }

    let prior = (reader.last_position(), reader.last_inode(), reader.last_line_tail().to_string());
    let mut owned_reader = std::mem::replace(
        reader,
        IncrementalReader::new(shared.path.clone(), prior.0, prior.1, prior.2.clone()),
    );
    let (result, returned_reader) = tokio::task::spawn_blocking(move || {
        let result = owned_reader.read_batch(remaining);
        (result, owned_reader)
    })
    .await
    .unwrap_or_else(|e| {
        log::error!("reader task panicked: {e}");
        (
            Ok(ReadBatch::default()),
            IncrementalReader::new(shared.path.clone(), prior.0, prior.1, prior.2.clone()),
        )
    });
    *reader = returned_reader;

    let batch = match result {
        Ok(batch) => batch,
        Err(e) => {
            log::error!("reader error for {}: {e}", shared.name);
            return;
        }
    };

    if batch.lines.is_empty() {
        // Caught up to EOF. Only a source that started this run at byte 0
        // was actually importing a backlog; a source that was already
        // caught up (or resuming mid-backlog from a prior run) must not
        // flip the store's shared first-load flag out from under sources
        // that still depend on it.
        if state.initial_load_pending {
            shared.store.disable_first_load_mode();
            state.initial_load_pending = false;
        }
        return;
    }

    let (records, dropped) = parse_and_enrich_all(
        batch.lines,
        shared.parser.clone(),
        shared.geo.clone(),
        shared.ua.clone(),
        shared.name.clone(),
        shared.config.worker_pool_size,
    )
    .await;
    shared.lines_dropped.fetch_add(dropped, Ordering::Relaxed);

    state.batch.extend(records);
    state.pending_checkpoint = Some((batch.new_position, batch.new_inode, batch.new_line_tail));
}

/// Writes the accumulated batch. On success, clears the batch and commits the
/// checkpoint pending from the read(s) that produced it. On failure, the
/// batch and pending checkpoint are left untouched for a retry on the next
/// tick — the reader's own position is never rolled back, since bytes it
/// already returned must not be re-read (§4.1's internal advance rule)
async fn flush(shared: &Arc<Shared>, reader: &mut IncrementalReader, state: &mut LoopState) {
    if state.batch.is_empty() {
        return;
    }

    match shared.store.create_batch(&state.batch) {
        Ok(outcome) => {
            shared.batches_written.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "{}: wrote batch (inserted={}, skipped={})",
                shared.name,
                outcome.inserted,
                outcome.skipped
            );
            state.batch.clear();
            if let Some((pos, inode, tail)) = state.pending_checkpoint.take() {
                commit_checkpoint(shared, reader, pos, inode, &tail);
                state.last_committed = (pos, inode, tail);
            }
        }
        Err(e) => {
            shared.write_errors.fetch_add(state.batch.len() as u64, Ordering::Relaxed);
            log::error!("{}: batch write failed, keeping batch for retry: {e}", shared.name);
        }
    }
}

/// Position-update tick: commits a checkpoint that a prior flush already made
/// durable-safe but that hasn't been written yet, as long as the batch is
/// currently empty. Never commits while the batch still holds unflushed
/// records
fn commit_pending_if_batch_empty(shared: &Arc<Shared>, reader: &mut IncrementalReader, state: &mut LoopState) {
    if !state.batch.is_empty() {
        return;
    }
    let Some((pos, inode, tail)) = state.pending_checkpoint.take() else {
        return;
    };
    if (pos, inode, tail.clone()) == state.last_committed {
        return;
    }
    commit_checkpoint(shared, reader, pos, inode, &tail);
    state.last_committed = (pos, inode, tail);
}

/// Writes `(position, inode, tail)` to the source registry (idempotent,
/// last-writer-wins) and mirrors it into the reader's monotonic guard.
fn commit_checkpoint(shared: &Arc<Shared>, reader: &mut IncrementalReader, pos: u64, inode: u64, tail: &str) {
    if let Err(e) = shared.registry.update_tracking(&shared.name, pos, inode, tail) {
        log::error!("{}: failed to persist checkpoint: {e}", shared.name);
        return;
    }
    reader.update_position(pos, inode, tail);
}

async fn parse_and_enrich_all(
    lines: Vec<String>,
    parser: Arc<dyn LogParser>,
    geo: Arc<dyn GeoEnricher>,
    ua: Arc<dyn UserAgentClassifier>,
    source_name: String,
    worker_pool_size: usize,
) -> (Vec<HttpRequest>, u64) {
    let workers = worker_pool_size.max(1).min(lines.len().max(1));
    let chunk_size = lines.len().div_ceil(workers).max(1);

    let mut set = tokio::task::JoinSet::new();
    for chunk in lines.chunks(chunk_size) {
        let chunk = chunk.to_vec();
        let parser = parser.clone();
        let geo = geo.clone();
        let ua = ua.clone();
        let source_name = source_name.clone();
        set.spawn_blocking(move || {
            let mut out = Vec::with_capacity(chunk.len());
            let mut dropped = 0u64;
            for line in chunk {
                match parser.parse(&line) {
                    Ok(event) => {
                        let mut record = event.to_record(&source_name);
                        enrich_record(&mut record, geo.as_ref(), ua.as_ref());
                        out.push(record);
                    }
                    Err(_) => {
                        log::warn!("{source_name}: dropping unparseable line");
                        dropped += 1;
                    }
                }
            }
            (out, dropped)
        });
    }

    let mut records = Vec::with_capacity(lines.len());
    let mut total_dropped = 0u64;
    while let Some(res) = set.join_next().await {
        match res {
            Ok((mut chunk_records, dropped)) => {
                records.append(&mut chunk_records);
                total_dropped += dropped;
            }
            Err(e) => log::error!("worker task panicked: {e}"),
        }
    }
    (records, total_dropped)
}

/// Apply the initial import-limit cutoff, only for a source that has never
/// produced a stored record — detected via the store, not the reader's
/// position, so a rotation reset doesn't cause the limit to be reapplied on
/// every restart. Commits the found offset as the source's initial checkpoint
async fn apply_initial_import_limit(
    shared: &Arc<Shared>,
    reader: &mut IncrementalReader,
) -> crate::error::Result<()> {
    if reader.last_position() != 0 {
        return Ok(());
    }
    if !shared.import_limit.is_active() {
        return Ok(());
    }
    if shared.store.count_for_source(&shared.name)? > 0 {
        return Ok(());
    }

    let cutoff = current_unix_seconds() - shared.import_limit.days as i64 * 86_400;
    let parser = shared.parser.clone();
    let path = shared.path.clone();
    let reader_snapshot = IncrementalReader::new(path, 0, 0, "");
    let found = tokio::task::spawn_blocking(move || reader_snapshot.find_start_by_date(cutoff, parser.as_ref()))
        .await
        .map_err(|e| IngestError::BatchWrite(format!("import-limit worker panicked: {e}")))?
        .map_err(IngestError::Reader)?;

    reader.update_position(found, 0, "");
    if let Err(e) = shared.registry.update_tracking(&shared.name, found, 0, "") {
        log::error!("{}: failed to persist initial import checkpoint: {e}", shared.name);
    }
    log::info!("{}: initial import limit applied, starting at byte {found}", shared.name);
    Ok(())
}

fn current_unix_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{NoopGeoEnricher, NoopUaClassifier};
    use crate::parser::traefik::TraefikParser;
    use crate::store::sqlite::SqliteStore;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            batch_size: 100,
            batch_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(20),
            position_update_interval: Duration::from_millis(20),
            worker_pool_size: 2,
        }
    }

    #[tokio::test]
    async fn processes_a_batch_and_persists_checkpoint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(
            &path,
            "{\"ClientHost\":\"10.0.0.1:1\",\"RequestMethod\":\"GET\",\"RequestPath\":\"/\",\"DownstreamStatus\":200,\"StartUTC\":\"2025-01-02T03:04:05Z\"}\n",
        )
        .unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = store.clone();
        let source = LogSource::new("web", path.to_string_lossy().to_string(), "traefik");
        registry.upsert(&source).unwrap();

        let mut processor = SourceProcessor::new(
            source,
            Arc::new(TraefikParser::new()),
            store.clone(),
            registry.clone(),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
            ImportLimitConfig { enabled: false, days: 0 },
        );

        processor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        processor.stop().await;

        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert_eq!(store.count().unwrap(), 1);
        let sources = registry.find_all().unwrap();
        assert!(sources[0].last_position > 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_dropped_not_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(&path, "not a log line at all\n").unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let source = LogSource::new("web", path.to_string_lossy().to_string(), "traefik");
        store.upsert(&source).unwrap();

        let mut processor = SourceProcessor::new(
            source,
            Arc::new(TraefikParser::new()),
            store.clone(),
            store.clone(),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
            ImportLimitConfig { enabled: false, days: 0 },
        );

        processor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        processor.stop().await;

        assert_eq!(store.count().unwrap(), 0);
        assert_eq!(processor.lines_dropped(), 1);
        // The line was still consumed (checkpoint advanced) even though it
        // produced no record — a malformed line is dropped, not retried forever.
        let sources = store.find_all().unwrap();
        assert!(sources[0].last_position > 0);
    }

    #[tokio::test]
    async fn resumes_from_a_persisted_checkpoint_instead_of_rereading_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(
            &path,
            "{\"ClientHost\":\"10.0.0.1:1\",\"RequestMethod\":\"GET\",\"RequestPath\":\"/a\",\"DownstreamStatus\":200,\"StartUTC\":\"2025-01-02T03:04:05Z\"}\n",
        )
        .unwrap();
        let size_after_first_line = fs::metadata(&path).unwrap().len();

        // A source whose checkpoint already sits at the end of the first line.
        let mut source = LogSource::new("web", path.to_string_lossy().to_string(), "traefik");
        source.last_position = size_after_first_line;

        std::io::Write::write_all(
            &mut fs::OpenOptions::new().append(true).open(&path).unwrap(),
            b"{\"ClientHost\":\"10.0.0.2:1\",\"RequestMethod\":\"GET\",\"RequestPath\":\"/b\",\"DownstreamStatus\":200,\"StartUTC\":\"2025-01-02T03:04:06Z\"}\n",
        )
        .unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.upsert(&source).unwrap();

        let mut processor = SourceProcessor::new(
            source,
            Arc::new(TraefikParser::new()),
            store.clone(),
            store.clone(),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
            ImportLimitConfig { enabled: false, days: 0 },
        );
        processor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        processor.stop().await;

        // Only the second line was ever read: total rows is 1, not 2.
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn a_resuming_source_reaching_eof_does_not_disable_shared_first_load_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(
            &path,
            "{\"ClientHost\":\"10.0.0.1:1\",\"RequestMethod\":\"GET\",\"RequestPath\":\"/a\",\"DownstreamStatus\":200,\"StartUTC\":\"2025-01-02T03:04:05Z\"}\n",
        )
        .unwrap();
        let size_after_first_line = fs::metadata(&path).unwrap().len();

        // This source's checkpoint already sits at EOF: it is resuming, not
        // importing a backlog, so reaching EOF on its very first poll must
        // not flip the store's shared first-load flag.
        let mut source = LogSource::new("resumer", path.to_string_lossy().to_string(), "traefik");
        source.last_position = size_after_first_line;

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store.upsert(&source).unwrap();
        assert!(store.is_first_load());

        let mut processor = SourceProcessor::new(
            source,
            Arc::new(TraefikParser::new()),
            store.clone(),
            store.clone(),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
            ImportLimitConfig { enabled: false, days: 0 },
        );
        processor.start();
        tokio::time::sleep(Duration::from_millis(150)).await;
        processor.stop().await;

        assert!(store.is_first_load());
    }

    #[tokio::test]
    async fn write_failure_keeps_batch_and_does_not_advance_checkpoint() {
        struct FailingStore {
            inner: Arc<SqliteStore>,
            attempts: AtomicU64,
        }
        impl RecordStore for FailingStore {
            fn count(&self) -> crate::error::Result<i64> {
                self.inner.count()
            }
            fn count_for_source(&self, source_name: &str) -> crate::error::Result<i64> {
                self.inner.count_for_source(source_name)
            }
            fn create_batch(&self, records: &[HttpRequest]) -> crate::error::Result<crate::store::BatchOutcome> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(IngestError::BatchWrite("simulated failure".into()));
                }
                self.inner.create_batch(records)
            }
            fn disable_first_load_mode(&self) {
                self.inner.disable_first_load_mode();
            }
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        fs::write(
            &path,
            "{\"ClientHost\":\"10.0.0.1:1\",\"RequestMethod\":\"GET\",\"RequestPath\":\"/\",\"DownstreamStatus\":200,\"StartUTC\":\"2025-01-02T03:04:05Z\"}\n",
        )
        .unwrap();

        let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = inner.clone();
        let store = Arc::new(FailingStore {
            inner: inner.clone(),
            attempts: AtomicU64::new(0),
        });
        let source = LogSource::new("web", path.to_string_lossy().to_string(), "traefik");
        registry.upsert(&source).unwrap();

        let mut processor = SourceProcessor::new(
            source,
            Arc::new(TraefikParser::new()),
            store.clone(),
            registry.clone(),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
            ImportLimitConfig { enabled: false, days: 0 },
        );

        processor.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        processor.stop().await;

        // The first attempt failed but the retry succeeded; no rows were lost
        // and none were duplicated because the reader never re-read the bytes.
        assert_eq!(inner.count().unwrap(), 1);
        assert!(processor.write_errors() >= 1);
    }
}
