//! Persistent SQLite tier
//!
//! Queries run synchronously on the calling task under the connection lock.
//! Lookups are single-row; similarity scans read at most
//! [`SCAN_LIMIT`] of the newest rows for a (provider, model).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::key::CacheKey;
use super::layer::{CacheEntry, CacheError, CacheLayer};
use crate::provider::GenerationOptions;

/// Most rows a similarity scan reads
pub const SCAN_LIMIT: usize = 1_000;

const CACHE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    provider_id TEXT NOT NULL,
    model_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    temperature REAL NOT NULL,
    max_tokens INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
CREATE INDEX IF NOT EXISTS idx_cache_provider_model ON cache_entries(provider_id, model_id, created_at);
";

/// Cache entries persisted in a local SQLite database
#[derive(Clone)]
pub struct SqliteLayer {
    conn: Arc<Mutex<Connection>>,
    max_entries: usize,
    ttl: Duration,
}

impl SqliteLayer {
    /// Open or create the cache database at `path`
    pub fn open(path: impl AsRef<Path>, max_entries: usize, ttl: Duration) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| CacheError::Storage(e.to_string()))?;
        Self::init(conn, max_entries, ttl)
    }

    /// Volatile database, for tests
    pub fn in_memory(max_entries: usize, ttl: Duration) -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory().map_err(|e| CacheError::Storage(e.to_string()))?;
        Self::init(conn, max_entries, ttl)
    }

    fn init(conn: Connection, max_entries: usize, ttl: Duration) -> Result<Self, CacheError> {
        conn.execute_batch(CACHE_SCHEMA)
            .map_err(|e| CacheError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_entries: max_entries.max(1),
            ttl,
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, CacheError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn).map_err(|e| CacheError::Storage(e.to_string()))
    }

    fn decode(raw: RawEntry) -> Result<CacheEntry, CacheError> {
        let value = serde_json::from_str(&raw.value).map_err(|e| CacheError::Decode(e.to_string()))?;
        Ok(CacheEntry {
            key: raw.key,
            value,
            provider_id: raw.provider_id,
            model_id: raw.model_id,
            prompt: raw.prompt,
            options: GenerationOptions {
                temperature: raw.temperature as f32,
                max_tokens: u32::try_from(raw.max_tokens).unwrap_or_default(),
            },
            created_at: DateTime::from_timestamp_millis(raw.created_at).unwrap_or_default(),
            expires_at: DateTime::from_timestamp_millis(raw.expires_at).unwrap_or_default(),
        })
    }
}

impl std::fmt::Debug for SqliteLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLayer")
            .field("max_entries", &self.max_entries)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

struct RawEntry {
    key: String,
    value: String,
    provider_id: String,
    model_id: String,
    prompt: String,
    temperature: f64,
    max_tokens: i64,
    created_at: i64,
    expires_at: i64,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            provider_id: row.get(2)?,
            model_id: row.get(3)?,
            prompt: row.get(4)?,
            temperature: row.get(5)?,
            max_tokens: row.get(6)?,
            created_at: row.get(7)?,
            expires_at: row.get(8)?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT key, value, provider_id, model_id, prompt, temperature, max_tokens, created_at, expires_at FROM cache_entries";

#[async_trait]
impl CacheLayer for SqliteLayer {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = Utc::now().timestamp_millis();
        let raw = self.with_conn(|conn| {
            conn.query_row(
                &format!("{SELECT_COLUMNS} WHERE key = ?1 AND expires_at > ?2"),
                params![key.as_str(), now],
                RawEntry::from_row,
            )
            .optional()
        })?;
        raw.map(Self::decode).transpose()
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let value = serde_json::to_string(&entry.value).map_err(|e| CacheError::Decode(e.to_string()))?;
        let max_entries = self.max_entries as i64;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                    (key, value, provider_id, model_id, prompt, temperature, max_tokens, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.key,
                    value,
                    entry.provider_id,
                    entry.model_id,
                    entry.prompt,
                    f64::from(entry.options.temperature),
                    i64::from(entry.options.max_tokens),
                    entry.created_at.timestamp_millis(),
                    entry.expires_at.timestamp_millis(),
                ],
            )?;
            // Oldest rows beyond capacity go first
            conn.execute(
                "DELETE FROM cache_entries WHERE key IN (
                    SELECT key FROM cache_entries
                    ORDER BY created_at DESC, rowid DESC
                    LIMIT -1 OFFSET ?1
                 )",
                params![max_entries],
            )?;
            Ok(())
        })
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.with_conn(|conn| {
            let rows = conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key.as_str()])?;
            Ok(rows > 0)
        })
    }

    async fn scan(&self, provider: &str, model: &str) -> Result<Vec<CacheEntry>, CacheError> {
        let now = Utc::now().timestamp_millis();
        let raws = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE provider_id = ?1 AND model_id = ?2 AND expires_at > ?3
                 ORDER BY created_at DESC LIMIT ?4"
            ))?;
            let rows = stmt.query_map(params![provider, model, now, SCAN_LIMIT as i64], RawEntry::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            match Self::decode(raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::debug!(error = %e, "Skipping undecodable cache row"),
            }
        }
        Ok(entries)
    }

    async fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", params![now]))
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
        })
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.with_conn(|conn| conn.execute("DELETE FROM cache_entries", []).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{CompletionResponse, TokenCounts};

    fn entry(prompt: &str, ttl: Duration) -> (CacheKey, CacheEntry) {
        let key = CacheKey::generate(prompt, "p", "m", 0.7, 10);
        let value = CompletionResponse::new(format!("answer to {prompt}"), "m", TokenCounts::new(3, 4));
        let entry = CacheEntry::new(&key, value, "p", "m", prompt, ttl);
        (key, entry)
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let layer = SqliteLayer::in_memory(16, Duration::from_secs(60)).unwrap();
        let (key, e) = entry("hello", Duration::from_secs(60));

        layer.set(e.clone()).await.unwrap();
        let found = layer.get(&key).await.unwrap().unwrap();
        assert_eq!(found.value, e.value);
        assert_eq!(found.prompt, "hello");
        assert!(layer.remove(&key).await.unwrap());
        assert!(layer.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let layer = SqliteLayer::in_memory(2, Duration::from_secs(60)).unwrap();
        let (k1, e1) = entry("one", Duration::from_secs(60));
        let (_, e2) = entry("two", Duration::from_secs(60));
        let (k3, e3) = entry("three", Duration::from_secs(60));

        layer.set(e1).await.unwrap();
        layer.set(e2).await.unwrap();
        layer.set(e3).await.unwrap();

        assert_eq!(layer.len().await.unwrap(), 2);
        assert!(layer.get(&k1).await.unwrap().is_none());
        assert!(layer.get(&k3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_rows_are_misses_until_cleanup() {
        let layer = SqliteLayer::in_memory(16, Duration::from_secs(60)).unwrap();
        let (key, expired) = entry("old", Duration::ZERO);
        let (_, live) = entry("new", Duration::from_secs(60));
        layer.set(expired).await.unwrap();
        layer.set(live).await.unwrap();

        assert!(layer.get(&key).await.unwrap().is_none());
        assert_eq!(layer.scan("p", "m").await.unwrap().len(), 1);
        assert_eq!(layer.len().await.unwrap(), 2);
        assert_eq!(layer.cleanup_expired().await.unwrap(), 1);
        assert_eq!(layer.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_options_persist() {
        let layer = SqliteLayer::in_memory(16, Duration::from_secs(60)).unwrap();
        let (key, e) = entry("tuned", Duration::from_secs(60));
        let options = GenerationOptions {
            temperature: 0.25,
            max_tokens: 512,
        };
        layer.set(e.with_options(options)).await.unwrap();

        let found = layer.get(&key).await.unwrap().unwrap();
        assert_eq!(found.options, options);
        assert!(found.generated_with(&options));
    }

    #[tokio::test]
    async fn test_scan_reads_newest_rows_only() {
        let layer = SqliteLayer::in_memory(SCAN_LIMIT + 10, Duration::from_secs(60)).unwrap();
        for i in 0..SCAN_LIMIT + 5 {
            let (_, mut e) = entry(&format!("prompt {i}"), Duration::from_secs(60));
            e.created_at += chrono::Duration::milliseconds(i as i64);
            layer.set(e).await.unwrap();
        }

        let scanned = layer.scan("p", "m").await.unwrap();
        assert_eq!(scanned.len(), SCAN_LIMIT);
        assert!(scanned.iter().all(|e| e.prompt != "prompt 0"));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let (key, e) = entry("persist me", Duration::from_secs(60));

        SqliteLayer::open(&path, 16, Duration::from_secs(60))
            .unwrap()
            .set(e)
            .await
            .unwrap();

        let reopened = SqliteLayer::open(&path, 16, Duration::from_secs(60)).unwrap();
        assert!(reopened.get(&key).await.unwrap().is_some());
    }
}
