//! Enrichment boundary: GeoIP and User-Agent classification
//!
//! These are out of scope as *implementations* — the real lookups are pure
//! external collaborators — but the trait boundary and a no-op default live
//! here so the pipeline is runnable and testable without a real GeoIP
//! database or UA ruleset.

use crate::record::HttpRequest;
use std::fmt;

/// A non-fatal enrichment failure. The record is still inserted; only the
/// enrichment fields are left unset
#[derive(Debug, Clone)]
pub struct EnrichError(pub String);

impl fmt::Display for EnrichError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enrichment failed: {}", self.0)
    }
}

impl std::error::Error for EnrichError {}

/// Mutates a record's geo fields in place from its `client_ip`.
pub trait GeoEnricher: Send + Sync {
    fn enrich(&self, record: &mut HttpRequest) -> Result<(), EnrichError>;
}

/// Derived User-Agent fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UaInfo {
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device_type: String,
}

pub trait UserAgentClassifier: Send + Sync {
    fn classify(&self, user_agent: &str) -> UaInfo;
}

/// Default GeoIP enricher: leaves geo fields unset. Stand-in for a real
/// MaxMind/IP2Location lookup supplied by the host process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopGeoEnricher;

impl GeoEnricher for NoopGeoEnricher {
    fn enrich(&self, _record: &mut HttpRequest) -> Result<(), EnrichError> {
        Ok(())
    }
}

/// Default UA classifier: leaves browser/os/device fields unset. Stand-in
/// for a real UA parsing library supplied by the host process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUaClassifier;

impl UserAgentClassifier for NoopUaClassifier {
    fn classify(&self, _user_agent: &str) -> UaInfo {
        UaInfo::default()
    }
}

/// Applies both enrichers to a record, matching the processor's failure
/// policy: a failed geo lookup is logged at debug and otherwise ignored.
pub fn enrich_record(
    record: &mut HttpRequest,
    geo: &dyn GeoEnricher,
    ua: &dyn UserAgentClassifier,
) {
    if let Err(e) = geo.enrich(record) {
        log::debug!("geo enrichment skipped for {}: {e}", record.request_hash);
    }

    if !record.user_agent.is_empty() {
        let info = ua.classify(&record.user_agent);
        record.browser = info.browser;
        record.browser_version = info.browser_version;
        record.os = info.os;
        record.os_version = info.os_version;
        record.device_type = info.device_type;
    }
}
