//! SQLite-based query cache.
//!
//! Persistent caching of generated SQL, table schemas, embedding
//! vectors, dry-run validations, execution results and the per-dataset
//! date-range probe. The cache is stored in `~/.askql/cache.db`.
//!
//! # Design
//!
//! - Key-value store with JSON values and a per-entry expiry
//! - Versioned - auto-clears on version mismatch
//! - Best-effort: callers log and ignore cache failures; a request never
//!   fails because the cache is unavailable
//!
//! # Key Format
//!
//! ```text
//! sql:{dataset}:{question_hash}   -> SqlArtifact
//! schema:{dataset}:{table}        -> TableSchema
//! embed:{model}:{text_hash}       -> Vec<f32>
//! dryrun:{sql_hash}               -> DryRun
//! result:{sql_hash}               -> ResultSet
//! daterange:{dataset}             -> DateRange
//! ```

mod hash;
pub use hash::text_hash;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

/// Current cache schema version. Bump this when the cache format changes.
const CACHE_VERSION: i32 = 1;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// SQLite-based query cache with per-entry TTLs.
pub struct QueryCache {
    conn: std::sync::Mutex<Connection>,
}

impl QueryCache {
    /// Open or create the cache database at `~/.askql/cache.db`.
    ///
    /// If the cache version doesn't match, it's automatically cleared.
    pub fn open() -> CacheResult<Self> {
        let path = Self::cache_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        let cache = Self {
            conn: std::sync::Mutex::new(conn),
        };
        cache.init()?;

        Ok(cache)
    }

    /// Open an in-memory cache (for testing).
    pub fn open_in_memory() -> CacheResult<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self {
            conn: std::sync::Mutex::new(conn),
        };
        cache.init()?;
        Ok(cache)
    }

    /// Get the path to the cache database.
    pub fn cache_path() -> CacheResult<PathBuf> {
        let base = dirs::home_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(base.join(".askql").join("cache.db"))
    }

    fn init(&self) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                hits INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == CACHE_VERSION => {}
            Some(_) => {
                conn.execute("DELETE FROM cache", [])?;
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
                    params![CACHE_VERSION.to_string()],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
                    params![CACHE_VERSION.to_string()],
                )?;
            }
        }

        Ok(())
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Get a value from the cache. Expired entries are deleted and
    /// reported as misses.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT value, expires_at FROM cache WHERE key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((_, expires_at)) if expires_at <= Self::now() => {
                conn.execute("DELETE FROM cache WHERE key = ?", params![key])?;
                Ok(None)
            }
            Some((json, _)) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Set a value in the cache with a TTL in seconds. Resets the hit
    /// counter.
    pub fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) -> CacheResult<()> {
        let json = serde_json::to_string(value)?;
        let expires_at = Self::now() + ttl_secs as i64;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO cache (key, value, expires_at, hits) VALUES (?, ?, ?, 0)",
            params![key, json, expires_at],
        )?;
        Ok(())
    }

    /// Increment an entry's hit counter and return the new count.
    ///
    /// Used for hot-question promotion: questions seen often enough keep
    /// their SQL for a longer TTL.
    pub fn record_hit(&self, key: &str) -> CacheResult<u32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cache SET hits = hits + 1 WHERE key = ?",
            params![key],
        )?;
        let hits: Option<u32> = conn
            .query_row(
                "SELECT hits FROM cache WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hits.unwrap_or(0))
    }

    /// Extend an entry's expiry without rewriting its value.
    pub fn extend_ttl(&self, key: &str, ttl_secs: u64) -> CacheResult<()> {
        let expires_at = Self::now() + ttl_secs as i64;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE cache SET expires_at = ? WHERE key = ?",
            params![expires_at, key],
        )?;
        Ok(())
    }

    /// Delete a value from the cache.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM cache WHERE key = ?", params![key])?;
        Ok(rows > 0)
    }

    /// Delete all entries matching a key prefix.
    pub fn delete_prefix(&self, prefix: &str) -> CacheResult<usize> {
        let pattern = format!("{}%", prefix);
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute("DELETE FROM cache WHERE key LIKE ?", params![pattern])?;
        Ok(rows)
    }

    /// Clear all cache entries (but keep metadata).
    pub fn clear_all(&self) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM cache", [])?;
        Ok(())
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();

        let entry_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))?;
        let live_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cache WHERE expires_at > ?",
            params![now],
            |row| row.get(0),
        )?;
        let total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM cache",
            [],
            |row| row.get(0),
        )?;

        Ok(CacheStats {
            entry_count: entry_count as usize,
            live_count: live_count as usize,
            total_size_bytes: total_size as usize,
        })
    }
}

/// Cache statistics.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of entries in the cache, expired included.
    pub entry_count: usize,
    /// Number of unexpired entries.
    pub live_count: usize,
    /// Total size of all values in bytes.
    pub total_size_bytes: usize,
}

/// Helper for generating cache keys.
pub struct CacheKey;

impl CacheKey {
    /// Key for a generated SQL artifact.
    pub fn sql(dataset: &str, question: &str) -> String {
        format!("sql:{}:{}", dataset, text_hash(&question.to_lowercase()))
    }

    /// Key for a table schema.
    pub fn schema(dataset: &str, table: &str) -> String {
        format!("schema:{}:{}", dataset, table)
    }

    /// Key for an embedding vector.
    pub fn embed(model: &str, text: &str) -> String {
        format!("embed:{}:{}", model, text_hash(text))
    }

    /// Key for a dry-run validation.
    pub fn dryrun(sql: &str) -> String {
        format!("dryrun:{}", text_hash(sql))
    }

    /// Key for cached execution results.
    pub fn result(sql: &str) -> String {
        format!("result:{}", text_hash(sql))
    }

    /// Key for the per-dataset date range.
    pub fn daterange(dataset: &str) -> String {
        format!("daterange:{}", dataset)
    }

    /// Prefixes scoped to a dataset, invalidated on dataset switch.
    pub fn dataset_prefixes(dataset: &str) -> Vec<String> {
        vec![
            format!("sql:{}:", dataset),
            format!("schema:{}:", dataset),
            format!("daterange:{}", dataset),
        ]
    }
}
