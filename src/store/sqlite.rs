//! SQLite-backed `RecordStore` and `SourceRegistry`.
//!
//! A single `Arc<Mutex<Connection>>`, with schema applied once via
//! `execute_batch` and rows shaped with bound parameters. WAL mode plus a
//! first-load mode defer secondary-index creation until the initial bulk
//! import has finished, so the first pass over a large backlog isn't paying
//! index maintenance cost on every insert.

use super::{dedup_by_hash, split_batches, BatchOutcome, RecordStore};
use crate::error::{IngestError, Result};
use crate::record::HttpRequest;
use crate::source::{LogSource, SourceRegistry};
use rusqlite::types::Value;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS http_requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_name TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    client_ip TEXT NOT NULL,
    method TEXT NOT NULL,
    host TEXT NOT NULL,
    path TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    request_hash TEXT NOT NULL UNIQUE,
    client_port INTEGER,
    query_string TEXT NOT NULL,
    protocol TEXT NOT NULL,
    response_size INTEGER NOT NULL,
    response_time_ms REAL NOT NULL,
    duration_ns INTEGER NOT NULL,
    start_utc TEXT NOT NULL,
    requests_total INTEGER NOT NULL,
    router_name TEXT NOT NULL,
    backend_url TEXT NOT NULL,
    tls_version TEXT NOT NULL,
    tls_cipher TEXT NOT NULL,
    tls_sni TEXT NOT NULL,
    request_id TEXT NOT NULL,
    trace_id TEXT NOT NULL,
    browser TEXT NOT NULL,
    browser_version TEXT NOT NULL,
    os TEXT NOT NULL,
    os_version TEXT NOT NULL,
    device_type TEXT NOT NULL,
    geo_country TEXT NOT NULL,
    geo_city TEXT NOT NULL,
    geo_lat REAL,
    geo_lon REAL,
    geo_asn INTEGER,
    geo_asn_org TEXT NOT NULL,
    referer TEXT NOT NULL,
    user_agent TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS log_sources (
    name TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    parser_type TEXT NOT NULL,
    last_position INTEGER NOT NULL DEFAULT 0,
    last_inode INTEGER NOT NULL DEFAULT 0,
    last_line_tail TEXT NOT NULL DEFAULT '',
    last_read_at INTEGER NOT NULL DEFAULT 0
);
"#;

const DEFERRED_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_http_requests_source_name ON http_requests(source_name);
CREATE INDEX IF NOT EXISTS idx_http_requests_timestamp ON http_requests(timestamp);
CREATE INDEX IF NOT EXISTS idx_http_requests_client_ip ON http_requests(client_ip);
"#;

const INSERT_COLUMNS: &str = "source_name, timestamp, client_ip, method, host, path, \
    status_code, request_hash, client_port, query_string, protocol, response_size, \
    response_time_ms, duration_ns, start_utc, requests_total, router_name, backend_url, \
    tls_version, tls_cipher, tls_sni, request_id, trace_id, browser, browser_version, os, \
    os_version, device_type, geo_country, geo_city, geo_lat, geo_lon, geo_asn, geo_asn_org, \
    referer, user_agent";

const COLUMN_COUNT: usize = 36;

fn record_to_values(r: &HttpRequest) -> Vec<Value> {
    vec![
        Value::Text(r.source_name.clone()),
        Value::Integer(r.timestamp),
        Value::Text(r.client_ip.clone()),
        Value::Text(r.method.clone()),
        Value::Text(r.host.clone()),
        Value::Text(r.path.clone()),
        Value::Integer(r.status_code as i64),
        Value::Text(r.request_hash.clone()),
        r.client_port.map(|p| Value::Integer(p as i64)).unwrap_or(Value::Null),
        Value::Text(r.query_string.clone()),
        Value::Text(r.protocol.clone()),
        Value::Integer(r.response_size),
        Value::Real(r.response_time_ms),
        Value::Integer(r.duration_ns),
        Value::Text(r.start_utc.clone()),
        Value::Integer(r.requests_total),
        Value::Text(r.router_name.clone()),
        Value::Text(r.backend_url.clone()),
        Value::Text(r.tls_version.clone()),
        Value::Text(r.tls_cipher.clone()),
        Value::Text(r.tls_sni.clone()),
        Value::Text(r.request_id.clone()),
        Value::Text(r.trace_id.clone()),
        Value::Text(r.browser.clone()),
        Value::Text(r.browser_version.clone()),
        Value::Text(r.os.clone()),
        Value::Text(r.os_version.clone()),
        Value::Text(r.device_type.clone()),
        Value::Text(r.geo_country.clone()),
        Value::Text(r.geo_city.clone()),
        r.geo_lat.map(Value::Real).unwrap_or(Value::Null),
        r.geo_lon.map(Value::Real).unwrap_or(Value::Null),
        r.geo_asn.map(|a| Value::Integer(a as i64)).unwrap_or(Value::Null),
        Value::Text(r.geo_asn_org.clone()),
        Value::Text(r.referer.clone()),
        Value::Text(r.user_agent.clone()),
    ]
}

/// Embedded store backing both `RecordStore` and `SourceRegistry` from a
/// single on-disk file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    first_load: Arc<AtomicBool>,
    indexes_created: Arc<AtomicBool>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(IngestError::Reader)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA_SQL)?;

        let existing_rows: i64 = conn.query_row("SELECT COUNT(*) FROM http_requests", [], |row| row.get(0))?;

        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            first_load: Arc::new(AtomicBool::new(existing_rows == 0)),
            indexes_created: Arc::new(AtomicBool::new(existing_rows > 0)),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
            first_load: Arc::new(AtomicBool::new(true)),
            indexes_created: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether the store is still in first-load (bulk-import) mode.
    pub fn is_first_load(&self) -> bool {
        self.first_load.load(Ordering::Acquire)
    }

    fn insert_row_by_row(conn: &Connection, chunk: &[HttpRequest]) -> rusqlite::Result<usize> {
        let placeholders: Vec<String> = (1..=COLUMN_COUNT).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO http_requests ({INSERT_COLUMNS}) VALUES ({}) ON CONFLICT(request_hash) DO NOTHING",
            placeholders.join(", ")
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut inserted = 0;
        for record in chunk {
            let values = record_to_values(record);
            inserted += stmt.execute(rusqlite::params_from_iter(values))?;
        }
        Ok(inserted)
    }

    fn insert_multi_row(conn: &Connection, chunk: &[HttpRequest]) -> rusqlite::Result<usize> {
        let mut values = Vec::with_capacity(chunk.len() * COLUMN_COUNT);
        let mut row_groups = Vec::with_capacity(chunk.len());
        for (row_idx, record) in chunk.iter().enumerate() {
            let base = row_idx * COLUMN_COUNT;
            let numbered: Vec<String> = (1..=COLUMN_COUNT).map(|i| format!("?{}", base + i)).collect();
            row_groups.push(format!("({})", numbered.join(", ")));
            values.extend(record_to_values(record));
        }

        let sql = format!(
            "INSERT INTO http_requests ({INSERT_COLUMNS}) VALUES {} ON CONFLICT(request_hash) DO NOTHING",
            row_groups.join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(rusqlite::params_from_iter(values))
    }
}

impl RecordStore for SqliteStore {
    fn count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM http_requests", [], |row| row.get(0))?)
    }

    fn count_for_source(&self, source_name: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM http_requests WHERE source_name = ?1",
            [source_name],
            |row| row.get(0),
        )?)
    }

    fn create_batch(&self, records: &[HttpRequest]) -> Result<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let deduped = dedup_by_hash(records);
        let mut skipped = records.len() - deduped.len();
        let mut inserted = 0;
        let first_load = self.first_load.load(Ordering::Acquire);

        let mut conn = self.conn.lock().unwrap();
        for chunk in split_batches(&deduped) {
            let tx = conn.transaction()?;
            let chunk_inserted = if first_load {
                Self::insert_multi_row(&tx, chunk)?
            } else {
                Self::insert_row_by_row(&tx, chunk)?
            };
            tx.commit()?;
            inserted += chunk_inserted;
            skipped += chunk.len() - chunk_inserted;
        }

        Ok(BatchOutcome { inserted, skipped })
    }

    fn disable_first_load_mode(&self) {
        if self.first_load.swap(false, Ordering::AcqRel) {
            let conn = self.conn.clone();
            let indexes_created = self.indexes_created.clone();
            std::thread::spawn(move || {
                let conn = conn.lock().unwrap();
                if let Err(e) = conn.execute_batch(DEFERRED_INDEX_SQL) {
                    log::warn!("deferred index creation failed: {e}");
                    return;
                }
                indexes_created.store(true, Ordering::Release);
                log::debug!("deferred secondary indexes created");
            });
        }
    }
}

impl SourceRegistry for SqliteStore {
    fn find_all(&self) -> Result<Vec<LogSource>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, path, parser_type, last_position, last_inode, last_line_tail, last_read_at \
             FROM log_sources ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(LogSource {
                name: row.get(0)?,
                path: row.get(1)?,
                parser_type: row.get(2)?,
                last_position: row.get::<_, i64>(3)? as u64,
                last_inode: row.get::<_, i64>(4)? as u64,
                last_line_tail: row.get(5)?,
                last_read_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn update_tracking(&self, name: &str, position: u64, inode: u64, tail: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE log_sources SET last_position = ?2, last_inode = ?3, last_line_tail = ?4, last_read_at = ?5 \
             WHERE name = ?1",
            rusqlite::params![name, position as i64, inode as i64, tail, now_unix()],
        )?;
        Ok(())
    }

    fn upsert(&self, source: &LogSource) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO log_sources (name, path, parser_type, last_position, last_inode, last_line_tail, last_read_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(name) DO UPDATE SET path = excluded.path, parser_type = excluded.parser_type, \
             last_position = excluded.last_position, last_inode = excluded.last_inode, \
             last_line_tail = excluded.last_line_tail, last_read_at = excluded.last_read_at",
            rusqlite::params![
                source.name,
                source.path,
                source.parser_type,
                source.last_position as i64,
                source.last_inode as i64,
                source.last_line_tail,
                source.last_read_at,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM log_sources WHERE name = ?1", [name])?;
        Ok(())
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
