//! The Traefik parser: JSON access logs, Traefik CLF (with trailing
//! router/backend/duration fields), or generic CLF

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{LogParser, ParseRejected, ParsedEvent};

/// `client - userid [datetime] "METHOD path HTTP/ver" status size "ref" "ua"
/// requestsTotal "router" "server" durationMs`
const TRAEFIK_CLF_PATTERN: &str = r#"^(?P<client>\S+) \S+ \S+ \[(?P<datetime>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+) (?P<proto>[^"]*)" (?P<status>\d+) (?P<size>\S+) "(?P<referer>[^"]*)" "(?P<ua>[^"]*)" (?P<reqtotal>\d+) "(?P<router>[^"]*)" "(?P<server>[^"]*)" (?P<duration>\S+)\s*$"#;

/// Same shape without the Traefik-only trailing fields.
const GENERIC_CLF_PATTERN: &str = r#"^(?P<client>\S+) \S+ \S+ \[(?P<datetime>[^\]]+)\] "(?P<method>\S+) (?P<path>\S+) (?P<proto>[^"]*)" (?P<status>\d+) (?P<size>\S+) "(?P<referer>[^"]*)" "(?P<ua>[^"]*)"\s*$"#;

/// The Go reference time layout `02/Jan/2006:15:04:05 -0700`, as a chrono
/// strftime format string.
const CLF_DATETIME_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// Detects and parses Traefik JSON logs, Traefik CLF, and generic CLF.
/// Regexes are compiled once, at construction
pub struct TraefikParser {
    traefik_clf: Regex,
    generic_clf: Regex,
}

impl Default for TraefikParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TraefikParser {
    pub fn new() -> Self {
        TraefikParser {
            traefik_clf: Regex::new(TRAEFIK_CLF_PATTERN).expect("static regex is valid"),
            generic_clf: Regex::new(GENERIC_CLF_PATTERN).expect("static regex is valid"),
        }
    }

    fn parse_json(&self, line: &str) -> Result<ParsedEvent, ParseRejected> {
        let value: Value = serde_json::from_str(line).map_err(|_| ParseRejected)?;
        let map = value.as_object().ok_or(ParseRejected)?;

        let has_timestamp = map.contains_key("time") || map.contains_key("StartUTC");
        let has_client = map.contains_key("request_X-Real-Ip")
            || map.contains_key("ClientHost")
            || map.contains_key("ClientAddr");
        if !has_timestamp || !has_client {
            return Err(ParseRejected);
        }

        let str_field = |key: &str| map.get(key).and_then(Value::as_str).unwrap_or("").to_string();
        let int_field = |key: &str| map.get(key).and_then(Value::as_i64).unwrap_or(0);

        let client_host = map
            .get("ClientHost")
            .or_else(|| map.get("ClientAddr"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let (mut client_ip, mut client_port) = split_host_port(client_host);
        if client_ip.is_empty() {
            if let Some(ip) = map.get("request_X-Real-Ip").and_then(Value::as_str) {
                client_ip = ip.to_string();
                client_port = None;
            }
        }

        let start_utc = {
            let s = str_field("StartUTC");
            if !s.is_empty() { s } else { str_field("time") }
        };
        let timestamp_unix = parse_rfc3339_unix(&start_utc).unwrap_or_else(now_unix_debug_logged);

        let method = {
            let m = str_field("RequestMethod");
            if m.is_empty() { "GET".to_string() } else { m.to_uppercase() }
        };

        let full_path = {
            let p = str_field("RequestPath");
            if !p.is_empty() { p } else { str_field("RequestURI") }
        };
        let (path, query_string) = split_path_query(&full_path);

        let status_code = crate::record::HttpRequest::normalize_status(int_field("DownstreamStatus"));
        let response_size = int_field("DownstreamContentSize");
        let duration_ns = int_field("Duration");
        let response_time_ms = duration_ns as f64 / 1_000_000.0;

        let mut referer = str_field("Referer");
        if referer.is_empty() {
            referer = str_field("request_Referer");
        }
        referer = apply_redirect_fallback(referer, &query_string);

        let mut user_agent = str_field("request_User-Agent");
        if user_agent.is_empty() {
            user_agent = str_field("UserAgent");
        }

        Ok(ParsedEvent {
            timestamp_unix,
            client_ip,
            client_port,
            method,
            host: str_field("RequestHost"),
            path,
            query_string,
            protocol: str_field("RequestProtocol"),
            status_code,
            response_size,
            response_time_ms,
            duration_ns,
            start_utc,
            requests_total: int_field("RequestCount"),
            router_name: str_field("RouterName"),
            backend_url: {
                let s = str_field("ServiceURL");
                if !s.is_empty() { s } else { str_field("ServiceAddr") }
            },
            referer,
            user_agent,
            tls_version: str_field("TLSVersion"),
            tls_cipher: str_field("TLSCipher"),
            tls_sni: str_field("TLSClientSubject"),
            request_id: str_field("RequestId"),
            trace_id: str_field("TraceId"),
        })
    }

    fn parse_traefik_clf(&self, line: &str) -> Result<ParsedEvent, ParseRejected> {
        let caps = self.traefik_clf.captures(line).ok_or(ParseRejected)?;
        let timestamp_unix = parse_clf_datetime(&caps["datetime"]).unwrap_or_else(now_unix_debug_logged);
        let start_utc = ns_string_from_unix(timestamp_unix);

        let (client_ip, client_port) = split_host_port(&caps["client"]);
        let (path, query_string) = split_path_query(&caps["path"]);
        let status_code = caps["status"]
            .parse::<i64>()
            .map(crate::record::HttpRequest::normalize_status)
            .unwrap_or(0);
        let response_size = if &caps["size"] == "-" { 0 } else { caps["size"].parse().unwrap_or(0) };
        let duration_ms = parse_ms_suffix(&caps["duration"]).unwrap_or(0.0);
        let duration_ns = (duration_ms * 1_000_000.0).round() as i64;

        let referer = apply_redirect_fallback(clf_dash_to_empty(&caps["referer"]), &query_string);

        Ok(ParsedEvent {
            timestamp_unix,
            client_ip,
            client_port,
            method: caps["method"].to_uppercase(),
            host: String::new(),
            path,
            query_string,
            protocol: caps["proto"].to_string(),
            status_code,
            response_size,
            response_time_ms: duration_ms,
            duration_ns,
            start_utc,
            requests_total: caps["reqtotal"].parse().unwrap_or(0),
            router_name: clf_dash_to_empty(&caps["router"]),
            backend_url: clf_dash_to_empty(&caps["server"]),
            referer,
            user_agent: clf_dash_to_empty(&caps["ua"]),
            tls_version: String::new(),
            tls_cipher: String::new(),
            tls_sni: String::new(),
            request_id: String::new(),
            trace_id: String::new(),
        })
    }

    fn parse_generic_clf(&self, line: &str) -> Result<ParsedEvent, ParseRejected> {
        let caps = self.generic_clf.captures(line).ok_or(ParseRejected)?;
        let timestamp_unix = parse_clf_datetime(&caps["datetime"]).unwrap_or_else(now_unix_debug_logged);
        let start_utc = ns_string_from_unix(timestamp_unix);

        let (client_ip, client_port) = split_host_port(&caps["client"]);
        let (path, query_string) = split_path_query(&caps["path"]);
        let status_code = caps["status"]
            .parse::<i64>()
            .map(crate::record::HttpRequest::normalize_status)
            .unwrap_or(0);
        let response_size = if &caps["size"] == "-" { 0 } else { caps["size"].parse().unwrap_or(0) };

        let referer = apply_redirect_fallback(clf_dash_to_empty(&caps["referer"]), &query_string);

        Ok(ParsedEvent {
            timestamp_unix,
            client_ip,
            client_port,
            method: caps["method"].to_uppercase(),
            host: String::new(),
            path,
            query_string,
            protocol: caps["proto"].to_string(),
            status_code,
            response_size,
            response_time_ms: 0.0,
            duration_ns: 0,
            start_utc,
            requests_total: 0,
            router_name: String::new(),
            backend_url: String::new(),
            referer,
            user_agent: clf_dash_to_empty(&caps["ua"]),
            tls_version: String::new(),
            tls_cipher: String::new(),
            tls_sni: String::new(),
            request_id: String::new(),
            trace_id: String::new(),
        })
    }
}

impl LogParser for TraefikParser {
    fn name(&self) -> &str {
        "traefik"
    }

    fn parse(&self, line: &str) -> Result<ParsedEvent, ParseRejected> {
        let trimmed = line.trim_start();
        if trimmed.starts_with('{') {
            return self.parse_json(trimmed);
        }
        if let Ok(event) = self.parse_traefik_clf(line) {
            return Ok(event);
        }
        self.parse_generic_clf(line)
    }
}

fn now_unix_debug_logged() -> i64 {
    log::debug!("substituting current wall time for a missing or invalid timestamp");
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn ns_string_from_unix(unix_seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true))
        .unwrap_or_default()
}

fn parse_rfc3339_unix(s: &str) -> Option<i64> {
    if s.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp())
}

fn parse_clf_datetime(s: &str) -> Option<i64> {
    DateTime::parse_from_str(s, CLF_DATETIME_FORMAT)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp())
}

fn parse_ms_suffix(s: &str) -> Option<f64> {
    s.strip_suffix("ms").and_then(|v| v.parse::<f64>().ok())
}

fn clf_dash_to_empty(s: &str) -> String {
    if s == "-" { String::new() } else { s.to_string() }
}

/// Split `host:port`, supporting bracketed IPv6 (`[::1]:8080`).
fn split_host_port(s: &str) -> (String, Option<u32>) {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let ip = rest[..end].to_string();
            let port = rest[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
            return (ip, port);
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_string(), port.parse().ok())
        }
        _ => (s.to_string(), None),
    }
}

/// Split on the first `?`.
fn split_path_query(s: &str) -> (String, String) {
    match s.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (s.to_string(), String::new()),
    }
}

/// If `referer` is empty and the query string carries a `redirect=`
/// parameter, use the URL-decoded redirect value as the referer
fn apply_redirect_fallback(referer: String, query_string: &str) -> String {
    if !referer.is_empty() {
        return referer;
    }
    for pair in query_string.split('&') {
        if let Some(value) = pair.strip_prefix("redirect=") {
            return percent_decode_str(value).decode_utf8_lossy().into_owned();
        }
    }
    referer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_a_json_happy_path() {
        let parser = TraefikParser::new();
        let line = r#"{"ClientHost":"203.0.113.7:52344","RequestMethod":"GET","RequestPath":"/index","RequestProtocol":"HTTP/1.1","DownstreamStatus":200,"DownstreamContentSize":1024,"Duration":1500000,"StartUTC":"2025-01-02T03:04:05.678901234Z","request_User-Agent":"Mozilla/5.0"}"#;

        assert!(parser.can_parse(line));
        let event = parser.parse(line).unwrap();
        assert_eq!(event.client_ip, "203.0.113.7");
        assert_eq!(event.client_port, Some(52344));
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/index");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.response_size, 1024);
        assert_eq!(event.response_time_ms, 1.5);
        assert_eq!(event.duration_ns, 1_500_000);
        assert_eq!(event.start_utc, "2025-01-02T03:04:05.678901234Z");
        assert_eq!(event.timestamp_unix, 1_735_787_045);
        assert_eq!(event.user_agent, "Mozilla/5.0");

        let record = event.to_record("test-source");
        assert_eq!(
            record.request_hash,
            crate::hash::request_hash(crate::hash::HashInput {
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
            })
        );
    }

    #[test]
    fn scenario_b_traefik_clf_with_redirect() {
        let parser = TraefikParser::new();
        let line = r#"198.51.100.5 - - [02/Jan/2025:03:04:05 +0000] "GET /login?redirect=https%3A%2F%2Fapp.example%2Fhome HTTP/1.1" 302 0 "-" "curl/8" 1 "router-a" "http://backend:8080" 7ms"#;

        assert!(parser.can_parse(line));
        let event = parser.parse(line).unwrap();
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/login");
        assert_eq!(event.query_string, "redirect=https%3A%2F%2Fapp.example%2Fhome");
        assert_eq!(event.status_code, 302);
        assert_eq!(event.response_time_ms, 7.0);
        assert_eq!(event.referer, "https://app.example/home");
        assert_eq!(event.router_name, "router-a");
        assert_eq!(event.backend_url, "http://backend:8080");
        assert_eq!(event.requests_total, 1);
    }

    #[test]
    fn generic_clf_has_no_traefik_fields() {
        let parser = TraefikParser::new();
        let line = r#"203.0.113.9 - - [02/Jan/2025:03:04:05 +0000] "POST /submit HTTP/1.1" 201 512 "-" "Mozilla/5.0""#;

        assert!(parser.can_parse(line));
        let event = parser.parse(line).unwrap();
        assert_eq!(event.method, "POST");
        assert_eq!(event.status_code, 201);
        assert_eq!(event.response_size, 512);
        assert_eq!(event.duration_ns, 0);
        assert!(event.router_name.is_empty());
        assert!(event.backend_url.is_empty());
        // Collapses to second precision, but still nanosecond-formatted text.
        assert!(event.start_utc.ends_with("Z"));
    }

    #[test]
    fn rejects_unrecognized_line() {
        let parser = TraefikParser::new();
        assert!(!parser.can_parse("this is not a log line"));
        assert!(parser.parse("this is not a log line").is_err());
    }

    #[test]
    fn status_code_out_of_range_collapses_to_zero() {
        let parser = TraefikParser::new();
        let line = r#"203.0.113.9 - - [02/Jan/2025:03:04:05 +0000] "GET /x HTTP/1.1" 999 0 "-" "-""#;
        let event = parser.parse(line).unwrap();
        assert_eq!(event.status_code, 0);
    }

    #[test]
    fn ipv6_client_is_split_correctly() {
        let (ip, port) = split_host_port("[2001:db8::1]:443");
        assert_eq!(ip, "2001:db8::1");
        assert_eq!(port, Some(443));
    }

    #[test]
    fn can_parse_matches_parse_success() {
        let parser = TraefikParser::new();
        for line in [
            r#"{"ClientHost":"1.2.3.4:1","RequestMethod":"GET","RequestPath":"/","DownstreamStatus":200,"StartUTC":"2025-01-02T03:04:05Z"}"#,
            r#"1.2.3.4 - - [02/Jan/2025:03:04:05 +0000] "GET / HTTP/1.1" 200 0 "-" "-""#,
            "garbage",
        ] {
            assert_eq!(parser.can_parse(line), parser.parse(line).is_ok());
        }
    }
}
