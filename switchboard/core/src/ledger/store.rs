//! Append-only usage records
//!
//! The SQLite store keeps one row per provider attempt in `usage_records`.
//! Timestamps are stored as Unix milliseconds so range scans stay on an
//! integer index.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::LedgerError;
use crate::provider::TokenCounts;

/// One provider attempt, successful or not
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub caller: Option<String>,
    pub tokens: TokenCounts,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
}

/// Durable sink for usage records
pub trait UsageStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn append(&self, record: &UsageRecord) -> Result<(), LedgerError>;

    /// Records with `start <= timestamp < end`, oldest first
    fn records_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UsageRecord>, LedgerError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store, the default when no ledger path is configured
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl UsageStore for MemoryUsageStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn append(&self, record: &UsageRecord) -> Result<(), LedgerError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn records_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UsageRecord>, LedgerError> {
        let mut records: Vec<UsageRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp < end)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }
}

// ============================================================================
// SQLite store
// ============================================================================

const USAGE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    caller TEXT,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    cached_tokens INTEGER NOT NULL,
    thinking_tokens INTEGER NOT NULL,
    cost REAL NOT NULL,
    latency_ms INTEGER NOT NULL,
    success INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_records(timestamp);
";

/// SQLite-backed usage ledger
///
/// Calls are synchronous and run on the caller's task. `append` is one
/// indexed insert per provider attempt; range reads are meant for startup
/// and reporting, not the request path.
#[derive(Clone)]
pub struct SqliteUsageStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteUsageStore {
    /// Open or create a ledger database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LedgerError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| LedgerError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    /// Volatile database, for tests
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(USAGE_SCHEMA)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn).map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub fn count(&self) -> Result<u64, LedgerError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM usage_records", [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
        let millis: i64 = row.get(0)?;
        Ok(UsageRecord {
            timestamp: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
            provider: row.get(1)?,
            model: row.get(2)?,
            caller: row.get(3)?,
            tokens: TokenCounts {
                input: row.get::<_, i64>(4)?.max(0) as u64,
                output: row.get::<_, i64>(5)?.max(0) as u64,
                cached: row.get::<_, i64>(6)?.max(0) as u64,
                thinking: row.get::<_, i64>(7)?.max(0) as u64,
            },
            cost: row.get(8)?,
            latency_ms: row.get::<_, i64>(9)?.max(0) as u64,
            success: row.get(10)?,
        })
    }
}

impl std::fmt::Debug for SqliteUsageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteUsageStore").finish_non_exhaustive()
    }
}

impl UsageStore for SqliteUsageStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn append(&self, record: &UsageRecord) -> Result<(), LedgerError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO usage_records (
                    timestamp, provider, model, caller, input_tokens, output_tokens,
                    cached_tokens, thinking_tokens, cost, latency_ms, success
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.timestamp.timestamp_millis(),
                    record.provider,
                    record.model,
                    record.caller,
                    record.tokens.input as i64,
                    record.tokens.output as i64,
                    record.tokens.cached as i64,
                    record.tokens.thinking as i64,
                    record.cost,
                    record.latency_ms as i64,
                    record.success,
                ],
            )?;
            Ok(())
        })
    }

    fn records_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<UsageRecord>, LedgerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, provider, model, caller, input_tokens, output_tokens,
                        cached_tokens, thinking_tokens, cost, latency_ms, success
                 FROM usage_records
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map(
                params![start.timestamp_millis(), end.timestamp_millis()],
                Self::row_to_record,
            )?;
            rows.collect()
        })
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Totals for one provider or model
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub requests: u64,
    pub successes: u64,
    pub tokens: TokenCounts,
    pub cost: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.requests += 1;
        if record.success {
            self.successes += 1;
        }
        self.tokens.add(&record.tokens);
        self.cost += record.cost;
    }
}

/// Usage aggregated over a time range
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total: UsageTotals,
    pub avg_latency_ms: f64,
    pub by_provider: BTreeMap<String, UsageTotals>,
    /// Keyed by `provider/model`
    pub by_model: BTreeMap<String, UsageTotals>,
}

impl UsageStats {
    #[must_use]
    pub fn from_records(start: DateTime<Utc>, end: DateTime<Utc>, records: &[UsageRecord]) -> Self {
        let mut stats = Self {
            start,
            end,
            ..Default::default()
        };
        let mut latency_sum = 0u64;

        for record in records {
            stats.total.add(record);
            latency_sum += record.latency_ms;
            stats
                .by_provider
                .entry(record.provider.clone())
                .or_default()
                .add(record);
            stats
                .by_model
                .entry(format!("{}/{}", record.provider, record.model))
                .or_default()
                .add(record);
        }

        if !records.is_empty() {
            stats.avg_latency_ms = latency_sum as f64 / records.len() as f64;
        }
        stats
    }
}
