//! Format-detecting log parsers

pub mod traefik;

use crate::hash::{self, HashInput};
use crate::record::HttpRequest;
use thiserror::Error;

/// A line didn't match any shape this parser recognizes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("line did not match a recognized log format")]
pub struct ParseRejected;

/// The canonical event a parser produces from one raw line, before
/// enrichment. design note, conversion to a storable record is
/// an explicit method (`to_record`) rather than reflection-based mapping;
/// `source_name` is deliberately not part of this type — it's set by the
/// `SourceProcessor`, not the parser.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEvent {
    pub timestamp_unix: i64,
    pub client_ip: String,
    pub client_port: Option<u32>,
    pub method: String,
    pub host: String,
    pub path: String,
    pub query_string: String,
    pub protocol: String,
    pub status_code: u16,
    pub response_size: i64,
    pub response_time_ms: f64,
    pub duration_ns: i64,
    pub start_utc: String,
    pub requests_total: i64,
    pub router_name: String,
    pub backend_url: String,
    pub referer: String,
    pub user_agent: String,
    pub tls_version: String,
    pub tls_cipher: String,
    pub tls_sni: String,
    pub request_id: String,
    pub trace_id: String,
}

impl ParsedEvent {
    /// Convert to a storable record, computing the dedup hash and stamping
    /// `source_name`. Geo/UA fields start empty; enrichment fills them in.
    pub fn to_record(&self, source_name: &str) -> HttpRequest {
        let request_hash = hash::request_hash(HashInput {
            unix_seconds: self.timestamp_unix,
            client_ip: &self.client_ip,
            method: &self.method,
            host: &self.host,
            path: &self.path,
            query_string: &self.query_string,
            status_code: self.status_code,
            duration_ns: self.duration_ns,
            start_utc: &self.start_utc,
            requests_total: self.requests_total,
        });

        HttpRequest {
            source_name: source_name.to_string(),
            timestamp: self.timestamp_unix,
            client_ip: self.client_ip.clone(),
            method: self.method.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
            status_code: self.status_code,
            request_hash,
            client_port: self.client_port,
            query_string: self.query_string.clone(),
            protocol: self.protocol.clone(),
            response_size: self.response_size,
            response_time_ms: self.response_time_ms,
            duration_ns: self.duration_ns,
            start_utc: self.start_utc.clone(),
            requests_total: self.requests_total,
            router_name: self.router_name.clone(),
            backend_url: self.backend_url.clone(),
            tls_version: self.tls_version.clone(),
            tls_cipher: self.tls_cipher.clone(),
            tls_sni: self.tls_sni.clone(),
            request_id: self.request_id.clone(),
            trace_id: self.trace_id.clone(),
            browser: String::new(),
            browser_version: String::new(),
            os: String::new(),
            os_version: String::new(),
            device_type: String::new(),
            geo_country: String::new(),
            geo_city: String::new(),
            geo_lat: None,
            geo_lon: None,
            geo_asn: None,
            geo_asn_org: String::new(),
            referer: self.referer.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

/// Identifies a line's shape and converts it to a `ParsedEvent`.
///
/// `can_parse(line)` is true iff `parse(line)` returns `Ok` — parsers never
/// reject in one method and accept in the other `parse` may still substitute a default timestamp and log at
/// debug level rather than fail, per §4.2.
pub trait LogParser: Send + Sync {
    fn name(&self) -> &str;

    fn can_parse(&self, line: &str) -> bool {
        self.parse(line).is_ok()
    }

    fn parse(&self, line: &str) -> Result<ParsedEvent, ParseRejected>;
}
