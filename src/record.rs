//! The canonical access-log event

use serde::{Deserialize, Serialize};

/// One canonical access-log event, ready for durable storage.
///
/// Constructed by a `SourceProcessor` from a parsed event plus enrichment;
/// never mutated after insertion. `source_name` is set by the processor, not
/// the parser
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpRequest {
    // Required fields.
    pub source_name: String,
    pub timestamp: i64,
    pub client_ip: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status_code: u16,
    pub request_hash: String,

    // Optional fields.
    pub client_port: Option<u32>,
    pub query_string: String,
    pub protocol: String,
    pub response_size: i64,
    pub response_time_ms: f64,
    pub duration_ns: i64,
    pub start_utc: String,
    pub requests_total: i64,
    pub router_name: String,
    pub backend_url: String,
    pub tls_version: String,
    pub tls_cipher: String,
    pub tls_sni: String,
    pub request_id: String,
    pub trace_id: String,

    // User-Agent derived.
    pub browser: String,
    pub browser_version: String,
    pub os: String,
    pub os_version: String,
    pub device_type: String,

    // Geo-derived.
    pub geo_country: String,
    pub geo_city: String,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub geo_asn: Option<u32>,
    pub geo_asn_org: String,

    pub referer: String,
    pub user_agent: String,
}

impl HttpRequest {
    /// `100 <= status_code < 600` ; any other value collapses to 0.
    pub fn normalize_status(code: i64) -> u16 {
        if (100..600).contains(&code) {
            code as u16
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_out_of_range_status() {
        assert_eq!(HttpRequest::normalize_status(200), 200);
        assert_eq!(HttpRequest::normalize_status(99), 0);
        assert_eq!(HttpRequest::normalize_status(600), 0);
        assert_eq!(HttpRequest::normalize_status(-1), 0);
    }
}
