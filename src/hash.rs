//! Deterministic content hash used for deduplication

use sha2::{Digest, Sha256};

/// Inputs to the canonical request hash, as the pipe-joined tuple defined by
/// §4.6: `unix_seconds | client_ip | method | host | path | query_string |
/// status_code | duration_ns | start_utc | requests_total`.
///
/// Missing text fields serialize as the empty string; missing integers as 0.
#[derive(Debug, Clone, Copy)]
pub struct HashInput<'a> {
    pub unix_seconds: i64,
    pub client_ip: &'a str,
    pub method: &'a str,
    pub host: &'a str,
    pub path: &'a str,
    pub query_string: &'a str,
    pub status_code: u16,
    pub duration_ns: i64,
    pub start_utc: &'a str,
    pub requests_total: i64,
}

/// Compute the lowercase hex SHA-256 `request_hash` for a canonical tuple.
///
/// Two events with an identical tuple are considered the same logical
/// request; the hash is the store's uniqueness key.
pub fn request_hash(input: HashInput<'_>) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        input.unix_seconds,
        input.client_ip,
        input.method,
        input.host,
        input.path,
        input.query_string,
        input.status_code,
        input.duration_ns,
        input.start_utc,
        input.requests_total,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_scenario_a() {
        // Scenario A from spec.md §8: JSON happy path, single line.
        let hash = request_hash(HashInput {
            unix_seconds: 1_735_787_045,
            client_ip: "203.0.113.7",
            method: "GET",
            host: "",
            path: "/index",
            query_string: "",
            status_code: 200,
            duration_ns: 1_500_000,
            start_utc: "2025-01-02T03:04:05.678901234Z",
            requests_total: 0,
        });
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        // Determinism: hashing the same tuple twice yields the same value.
        let hash2 = request_hash(HashInput {
            unix_seconds: 1_735_787_045,
            client_ip: "203.0.113.7",
            method: "GET",
            host: "",
            path: "/index",
            query_string: "",
            status_code: 200,
            duration_ns: 1_500_000,
            start_utc: "2025-01-02T03:04:05.678901234Z",
            requests_total: 0,
        });
        assert_eq!(hash, hash2);
    }

    #[test]
    fn differs_on_any_field_change() {
        let base = HashInput {
            unix_seconds: 1,
            client_ip: "1.1.1.1",
            method: "GET",
            host: "h",
            path: "/p",
            query_string: "",
            status_code: 200,
            duration_ns: 0,
            start_utc: "",
            requests_total: 0,
        };
        let changed = HashInput {
            status_code: 404,
            ..base
        };
        assert_ne!(request_hash(base), request_hash(changed));
    }
}
