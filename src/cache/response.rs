//! Response cache for verification runs.
//!
//! Distinct from the attack cache: memoizes bare `(prompt, model)` pairs so
//! a verifier replay never repays for an identical target call. One TTL for
//! the whole store; hit/miss counters feed the verification report.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A cached model response.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub prompt_hash: String,
    pub model: String,
    pub response: String,
    pub created_ts: i64,
    pub tokens: u64,
    pub cost: f64,
}

/// `(prompt, model) -> response` cache over a single sqlite file.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    path: PathBuf,
    ttl_seconds: i64,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl ResponseCache {
    /// Default entry lifetime.
    pub const DEFAULT_TTL_DAYS: i64 = 7;

    /// Open or create a response cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_ttl(path, Self::DEFAULT_TTL_DAYS)
    }

    /// Open with a custom TTL in days.
    pub fn open_with_ttl(path: impl AsRef<Path>, ttl_days: i64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Cache(format!("failed to create cache dir: {e}")))?;
            }
        }
        let cache = Self {
            path,
            ttl_seconds: ttl_days * 24 * 60 * 60,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        };
        cache.with_write_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS response_cache (
                    key TEXT PRIMARY KEY,
                    model TEXT NOT NULL,
                    created_ts INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    tokens INTEGER NOT NULL DEFAULT 0,
                    cost REAL NOT NULL DEFAULT 0.0
                );
                CREATE INDEX IF NOT EXISTS idx_response_created
                    ON response_cache(created_ts);",
            )
        })?;
        Ok(cache)
    }

    fn with_write_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::Cache(format!("failed to open response cache: {e}")))?;
        f(&conn).map_err(|e| Error::Cache(e.to_string()))
    }

    fn with_read_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| Error::Cache(format!("failed to open response cache: {e}")))?;
        f(&conn).map_err(|e| Error::Cache(e.to_string()))
    }

    fn hash_prompt(prompt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prompt.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn entry_key(prompt_hash: &str, model: &str) -> String {
        format!("{prompt_hash}:{model}")
    }

    /// Get a cached response if present and unexpired.
    pub fn get(&self, prompt: &str, model: &str) -> Result<Option<CachedResponse>> {
        let prompt_hash = Self::hash_prompt(prompt);
        let key = Self::entry_key(&prompt_hash, model);
        let cutoff = chrono::Utc::now().timestamp() - self.ttl_seconds;

        let row = self.with_read_conn(|conn| {
            conn.query_row(
                "SELECT model, created_ts, payload, tokens, cost
                 FROM response_cache
                 WHERE key = ?1 AND created_ts > ?2",
                params![key, cutoff],
                |row| {
                    Ok(CachedResponse {
                        prompt_hash: prompt_hash.clone(),
                        model: row.get(0)?,
                        created_ts: row.get(1)?,
                        response: row.get(2)?,
                        tokens: row.get::<_, i64>(3)? as u64,
                        cost: row.get(4)?,
                    })
                },
            )
            .optional()
        })?;

        match row {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(hash = &cached.prompt_hash[..8], model, "response cache hit");
                Ok(Some(cached))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(hash = &prompt_hash[..8], model, "response cache miss");
                Ok(None)
            }
        }
    }

    /// Store a response, upserting by `(prompt, model)`.
    pub fn put(
        &self,
        prompt: &str,
        model: &str,
        response: &str,
        tokens: u64,
        cost: f64,
    ) -> Result<()> {
        let key = Self::entry_key(&Self::hash_prompt(prompt), model);
        let now = chrono::Utc::now().timestamp();
        self.with_write_conn(|conn| {
            conn.execute(
                "INSERT INTO response_cache (key, model, created_ts, payload, tokens, cost)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(key) DO UPDATE SET
                    created_ts = excluded.created_ts,
                    payload = excluded.payload,
                    tokens = excluded.tokens,
                    cost = excluded.cost",
                params![key, model, now, response, tokens as i64, cost],
            )
        })?;
        Ok(())
    }

    /// Remove expired entries, returning the count removed.
    pub fn cleanup_expired(&self) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - self.ttl_seconds;
        let removed = self.with_write_conn(|conn| {
            conn.execute(
                "DELETE FROM response_cache WHERE created_ts <= ?1",
                params![cutoff],
            )
        })?;
        if removed > 0 {
            info!(removed, "cleaned up expired response cache entries");
        }
        Ok(removed as u64)
    }

    /// Remove every entry, returning the count removed.
    pub fn clear(&self) -> Result<u64> {
        let removed =
            self.with_write_conn(|conn| conn.execute("DELETE FROM response_cache", []))?;
        Ok(removed as u64)
    }

    /// Session hit count.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Session miss count.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Session hit rate in 0..1 (zero before any lookups).
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> Result<u64> {
        self.with_read_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM response_cache", [], |r| r.get(0))
        })
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
