#![warn(missing_docs)]

//! # accesslog-ingest
//!
//! Incremental tailing, parsing, enrichment and crash-safe persistence of
//! HTTP reverse-proxy access logs (Traefik JSON and Common Log Format).
//!
//! A [`Coordinator`] owns one [`SourceProcessor`] per tracked [`LogSource`].
//! Each processor tails its file with an [`IncrementalReader`] (rotation- and
//! truncation-aware), converts lines to [`record::HttpRequest`] via a
//! [`parser::LogParser`], applies optional geo/user-agent enrichment, and
//! commits batches to a [`store::RecordStore`] with content-hash
//! deduplication — only advancing its registry checkpoint once a batch is
//! durably written.
//!
//! ## Quick start
//!
//! ```no_run
//! use accesslog_ingest::config::CoordinatorConfig;
//! use accesslog_ingest::coordinator::{Coordinator, ParserRegistry};
//! use accesslog_ingest::enrich::{NoopGeoEnricher, NoopUaClassifier};
//! use accesslog_ingest::parser::traefik::TraefikParser;
//! use accesslog_ingest::parser::LogParser;
//! use accesslog_ingest::source::LogSource;
//! use accesslog_ingest::store::sqlite::SqliteStore;
//! use std::sync::Arc;
//!
//! struct Parsers;
//! impl ParserRegistry for Parsers {
//!     fn resolve(&self, parser_type: &str) -> Option<Arc<dyn LogParser>> {
//!         (parser_type == "traefik").then(|| Arc::new(TraefikParser::new()) as Arc<dyn LogParser>)
//!     }
//! }
//!
//! # async fn run() -> accesslog_ingest::error::Result<()> {
//! let store = Arc::new(SqliteStore::open("ingest.sqlite3".as_ref())?);
//! store.upsert(&LogSource::new("web", "/var/log/traefik/access.log", "traefik"))?;
//!
//! let coordinator = Arc::new(Coordinator::new(
//!     store.clone(),
//!     store.clone(),
//!     Arc::new(Parsers),
//!     Arc::new(NoopGeoEnricher),
//!     Arc::new(NoopUaClassifier),
//!     CoordinatorConfig::default(),
//! ));
//! coordinator.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod enrich;
pub mod error;
pub mod hash;
pub mod parser;
pub mod processor;
pub mod reader;
pub mod record;
pub mod source;
pub mod store;

pub use coordinator::Coordinator;
pub use error::{IngestError, Result};
pub use processor::{ProcessorState, SourceProcessor};
pub use reader::{IncrementalReader, ReadBatch};
pub use record::HttpRequest;
pub use source::{LogSource, SourceRegistry};
