//! `Coordinator`: owns the set of per-source processors and reconciles it
//! against the source registry

use crate::config::CoordinatorConfig;
use crate::enrich::{GeoEnricher, UserAgentClassifier};
use crate::error::Result;
use crate::parser::LogParser;
use crate::processor::{ProcessorState, SourceProcessor};
use crate::source::{LogSource, SourceRegistry};
use crate::store::RecordStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Snapshot of one managed source, returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub name: String,
    pub state: ProcessorStateLabel,
}

/// `ProcessorState` without the internal type leaking non-`Eq` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorStateLabel {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl From<ProcessorState> for ProcessorStateLabel {
    fn from(state: ProcessorState) -> Self {
        match state {
            ProcessorState::Idle => ProcessorStateLabel::Idle,
            ProcessorState::Running => ProcessorStateLabel::Running,
            ProcessorState::Stopping => ProcessorStateLabel::Stopping,
            ProcessorState::Stopped => ProcessorStateLabel::Stopped,
        }
    }
}

/// Resolves a source's `parser_type` string to a concrete `LogParser`. The
/// crate ships one parser (`TraefikParser`); a host process with more than
/// one format registers additional entries here.
pub trait ParserRegistry: Send + Sync {
    fn resolve(&self, parser_type: &str) -> Option<Arc<dyn LogParser>>;
}

struct Managed {
    processor: SourceProcessor,
}

/// Coordinates all tracked sources: starts/stops processors, and
/// periodically reconciles the in-memory set against the registry.
/// Mutations (`add`/`remove`/`sync`) are serialized through the processor map's lock.
pub struct Coordinator {
    registry: Arc<dyn SourceRegistry>,
    store: Arc<dyn RecordStore>,
    parsers: Arc<dyn ParserRegistry>,
    geo: Arc<dyn GeoEnricher>,
    ua: Arc<dyn UserAgentClassifier>,
    config: CoordinatorConfig,
    processors: Mutex<HashMap<String, Managed>>,
    running: std::sync::atomic::AtomicBool,
    sync_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_notify: Arc<tokio::sync::Notify>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<dyn SourceRegistry>,
        store: Arc<dyn RecordStore>,
        parsers: Arc<dyn ParserRegistry>,
        geo: Arc<dyn GeoEnricher>,
        ua: Arc<dyn UserAgentClassifier>,
        config: CoordinatorConfig,
    ) -> Self {
        Coordinator {
            registry,
            store,
            parsers,
            geo,
            ua,
            config,
            processors: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(false),
            sync_handle: std::sync::Mutex::new(None),
            stop_notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }

    pub async fn processor_count(&self) -> usize {
        self.processors.lock().await.len()
    }

    /// Loads every registered source, starts a processor for each, then
    /// spawns the periodic `sync()` loop.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return Ok(());
        }

        self.sync().await?;

        let this = self.clone();
        let stop_notify = self.stop_notify.clone();
        let interval = self.config.sync_interval;
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = stop_notify.notified() => break,
                    _ = timer.tick() => {
                        if let Err(e) = this.sync().await {
                            log::error!("coordinator sync failed: {e}");
                        }
                    }
                }
            }
        });
        *self.sync_handle.lock().unwrap() = Some(handle);

        Ok(())
    }

    /// Stops every processor and the sync loop. New `add`/`remove` calls are
    /// rejected once stopping has begun
    pub async fn stop(&self) {
        if !self.running.swap(false, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.stop_notify.notify_one();
        if let Some(handle) = self.sync_handle.lock().unwrap().take() {
            let _ = handle.await;
        }

        let drained: Vec<Managed> = self.processors.lock().await.drain().map(|(_, managed)| managed).collect();

        // Cancel every processor in parallel and wait for all of them to
        // return, per §4.4 — sequential awaiting here would make total
        // shutdown time the sum of every processor's final-flush time
        // instead of the slowest one.
        let mut set = tokio::task::JoinSet::new();
        for mut managed in drained {
            set.spawn(async move {
                managed.processor.stop().await;
            });
        }
        while set.join_next().await.is_some() {}
    }

    /// Reconciles the in-memory processor set against `registry.find_all()`:
    /// starts processors for newly-registered sources, stops and drops
    /// processors for sources no longer present
    pub async fn sync(&self) -> Result<()> {
        let sources = self.registry.find_all()?;
        let mut processors = self.processors.lock().await;

        let current_names: std::collections::HashSet<String> = sources.iter().map(|s| s.name.clone()).collect();
        let stale: Vec<String> = processors
            .keys()
            .filter(|name| !current_names.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(mut managed) = processors.remove(&name) {
                managed.processor.stop().await;
            }
        }

        for source in sources {
            if processors.contains_key(&source.name) {
                continue;
            }
            let Some(parser) = self.parsers.resolve(&source.parser_type) else {
                log::warn!("no parser registered for type {:?}, skipping source {}", source.parser_type, source.name);
                continue;
            };
            let mut processor = SourceProcessor::new(
                source.clone(),
                parser,
                self.store.clone(),
                self.registry.clone(),
                self.geo.clone(),
                self.ua.clone(),
                self.config.processor,
                self.config.import_limit,
            );
            processor.start();
            processors.insert(source.name, Managed { processor });
        }

        Ok(())
    }

    /// Registers a new source and starts it immediately. Rejected while the
    /// coordinator is stopping/stopped
    pub async fn add(&self, source: LogSource) -> Result<()> {
        if !self.is_running() {
            return Err(crate::error::IngestError::BatchWrite(
                "coordinator is not running".to_string(),
            ));
        }
        self.registry.upsert(&source)?;
        self.sync().await
    }

    /// Stops and removes a source.
    pub async fn remove(&self, name: &str) -> Result<()> {
        if !self.is_running() {
            return Err(crate::error::IngestError::BatchWrite(
                "coordinator is not running".to_string(),
            ));
        }
        if let Some(mut managed) = self.processors.lock().await.remove(name) {
            managed.processor.stop().await;
        }
        self.registry.remove(name)
    }

    pub async fn status(&self) -> Vec<SourceStatus> {
        let processors = self.processors.lock().await;
        let mut out: Vec<SourceStatus> = processors
            .values()
            .map(|m| SourceStatus {
                name: m.processor.name().to_string(),
                state: m.processor.state().into(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportLimitConfig;
    use crate::enrich::{NoopGeoEnricher, NoopUaClassifier};
    use crate::parser::traefik::TraefikParser;
    use crate::store::sqlite::SqliteStore;
    use std::time::Duration;
    use tempfile::tempdir;

    struct SingleParser;
    impl ParserRegistry for SingleParser {
        fn resolve(&self, parser_type: &str) -> Option<Arc<dyn LogParser>> {
            if parser_type == "traefik" {
                Some(Arc::new(TraefikParser::new()))
            } else {
                None
            }
        }
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig {
            sync_interval: Duration::from_millis(40),
            import_limit: ImportLimitConfig { enabled: false, days: 0 },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_picks_up_registered_sources_and_stop_drains_them() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        store
            .upsert(&LogSource::new("web", path.to_string_lossy().to_string(), "traefik"))
            .unwrap();

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(SingleParser),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
        ));

        coordinator.clone().start().await.unwrap();
        assert!(coordinator.is_running());
        assert_eq!(coordinator.processor_count().await, 1);

        coordinator.stop().await;
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.processor_count().await, 0);
    }

    #[tokio::test]
    async fn add_and_remove_mutate_the_processor_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(SingleParser),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
        ));
        coordinator.clone().start().await.unwrap();
        assert_eq!(coordinator.processor_count().await, 0);

        coordinator
            .add(LogSource::new("web", path.to_string_lossy().to_string(), "traefik"))
            .await
            .unwrap();
        assert_eq!(coordinator.processor_count().await, 1);

        coordinator.remove("web").await.unwrap();
        assert_eq!(coordinator.processor_count().await, 0);

        coordinator.stop().await;
    }

    #[tokio::test]
    async fn add_is_rejected_once_stopped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            store.clone(),
            Arc::new(SingleParser),
            Arc::new(NoopGeoEnricher),
            Arc::new(NoopUaClassifier),
            config(),
        ));

        let err = coordinator
            .add(LogSource::new("web", path.to_string_lossy().to_string(), "traefik"))
            .await;
        assert!(err.is_err());
    }
}
