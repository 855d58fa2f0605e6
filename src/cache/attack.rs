//! Versioned, TTL-bounded attack result cache.
//!
//! Attack runs are expensive (minutes of GPU time or hundreds of API
//! calls), so completed results are memoized under a fingerprint of their
//! inputs. Entries expire per-method: methods whose output depends on
//! short-lived model behavior expire sooner than methods whose output is
//! intrinsic to the target's weights.
//!
//! Concurrency discipline: every operation opens a short-lived connection;
//! no handle outlives its call. The store serialises writers at the file
//! level, so no cross-worker lock is needed.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::key::{cache_key, version_prefix};
use crate::error::{Error, Result};
use crate::plugins::AttackResult;

/// Core version used for the cache namespace unless overridden.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default TTLs in hours per attack method.
///
/// PAIR output tracks attacker-model behavior (7 days); GCG suffixes are a
/// property of the target weights (30 days); AutoDAN sits between (14
/// days).
pub fn default_ttl_hours(method: &str) -> f64 {
    match method {
        "pair" => 7.0 * 24.0,
        "gcg" => 30.0 * 24.0,
        "autodan" => 14.0 * 24.0,
        _ => 7.0 * 24.0,
    }
}

/// A cache hit: the stored result plus its provenance.
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// The memoized attack result
    pub result: AttackResult,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Version namespace the entry was written under
    pub core_version: String,
}

/// Cache population statistics.
#[derive(Debug, Clone, Default)]
pub struct AttackCacheStats {
    pub total: u64,
    pub by_version: HashMap<String, u64>,
    pub by_method: HashMap<String, u64>,
}

/// Attack result cache over a single sqlite file.
#[derive(Debug, Clone)]
pub struct AttackCache {
    path: PathBuf,
    core_version: String,
}

impl AttackCache {
    /// Default on-disk location, overridable via `AIPOP_CACHE_DB`.
    pub const DEFAULT_PATH: &'static str = "out/attack_cache.db";

    /// Open the cache at its default location, honouring the
    /// `AIPOP_CACHE_DB` override.
    pub fn open_default() -> Result<Self> {
        Self::open(super::resolve_cache_path(Self::DEFAULT_PATH))
    }

    /// Open or create a cache at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Cache(format!("failed to create cache dir: {e}")))?;
            }
        }
        let cache = Self {
            path,
            core_version: CORE_VERSION.to_string(),
        };
        cache.with_write_conn(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS attack_cache (
                    key TEXT PRIMARY KEY,
                    method TEXT NOT NULL,
                    implementation TEXT NOT NULL,
                    core_version TEXT NOT NULL,
                    created_ts INTEGER NOT NULL,
                    ttl_hours REAL NOT NULL,
                    payload TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_attack_created
                    ON attack_cache(created_ts);
                CREATE INDEX IF NOT EXISTS idx_attack_method_version
                    ON attack_cache(method, core_version);",
            )
        })?;
        Ok(cache)
    }

    /// Override the version namespace (tests bump this to simulate
    /// upgrades).
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.core_version = version.into();
        self
    }

    /// The active version namespace.
    pub fn core_version(&self) -> &str {
        &self.core_version
    }

    fn with_write_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::Cache(format!("failed to open cache: {e}")))?;
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
        .map_err(|e| Error::Cache(format!("failed to open cache read-only: {e}")))?;
        f(&conn).map_err(|e| Error::Cache(e.to_string()))
    }

    /// Compute the key an attack run would be stored under.
    pub fn key_for(
        &self,
        method: &str,
        implementation: &str,
        prompt: &str,
        model: &str,
        params: &Value,
    ) -> String {
        cache_key(
            &self.core_version,
            method,
            implementation,
            prompt,
            model,
            params,
        )
    }

    /// Look up a fresh entry for the given inputs.
    ///
    /// Returns a miss for expired rows and for rows written under another
    /// version namespace; neither is deleted here (see
    /// [`Self::sweep_expired`]).
    pub fn get(
        &self,
        method: &str,
        prompt: &str,
        model: &str,
        implementation: &str,
        params: &Value,
    ) -> Result<Option<CachedResult>> {
        let key = self.key_for(method, implementation, prompt, model, params);
        let row = self.with_read_conn(|conn| {
            conn.query_row(
                "SELECT core_version, created_ts, ttl_hours, payload
                 FROM attack_cache WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((version, created_ts, ttl_hours, payload)) = row else {
            debug!(%key, "cache miss");
            return Ok(None);
        };

        if version != self.core_version {
            debug!(%key, stored = %version, "cache miss: version namespace mismatch");
            return Ok(None);
        }

        let age_secs = Utc::now().timestamp() - created_ts;
        if age_secs as f64 > ttl_hours * 3600.0 {
            debug!(%key, age_secs, "cache miss: entry expired");
            return Ok(None);
        }

        let result: AttackResult = serde_json::from_str(&payload)
            .map_err(|e| Error::Cache(format!("corrupt cache payload: {e}")))?;

        debug!(%key, "cache hit");
        Ok(Some(CachedResult {
            result,
            created_at: Utc
                .timestamp_opt(created_ts, 0)
                .single()
                .unwrap_or_else(Utc::now),
            core_version: version,
        }))
    }

    /// Store an attack result, upserting by key.
    pub fn put(
        &self,
        method: &str,
        prompt: &str,
        model: &str,
        implementation: &str,
        params: &Value,
        result: &AttackResult,
        ttl_hours: Option<f64>,
    ) -> Result<()> {
        let key = self.key_for(method, implementation, prompt, model, params);
        let ttl = ttl_hours.unwrap_or_else(|| default_ttl_hours(method));
        let payload = serde_json::to_string(result)?;
        let created_ts = Utc::now().timestamp();

        self.with_write_conn(|conn| {
            conn.execute(
                "INSERT INTO attack_cache
                    (key, method, implementation, core_version, created_ts, ttl_hours, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(key) DO UPDATE SET
                    created_ts = excluded.created_ts,
                    ttl_hours = excluded.ttl_hours,
                    payload = excluded.payload",
                params![
                    key,
                    method,
                    implementation,
                    self.core_version,
                    created_ts,
                    ttl,
                    payload
                ],
            )
        })?;
        debug!(method, implementation, "cached attack result");
        Ok(())
    }

    /// Remove every entry written under the given version namespace.
    ///
    /// Returns the number of entries removed.
    pub fn clear_by_version(&self, version: &str) -> Result<u64> {
        let prefix = version_prefix(version);
        let removed = self.with_write_conn(|conn| {
            conn.execute(
                "DELETE FROM attack_cache WHERE key LIKE ?1 || '%'",
                params![prefix],
            )
        })?;
        info!(version, removed, "cleared cache entries by version");
        Ok(removed as u64)
    }

    /// Remove expired entries. Gets never delete; this is the explicit
    /// garbage operation.
    pub fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        let removed = self.with_write_conn(|conn| {
            conn.execute(
                "DELETE FROM attack_cache
                 WHERE (?1 - created_ts) > ttl_hours * 3600.0",
                params![now],
            )
        })?;
        if removed > 0 {
            info!(removed, "swept expired cache entries");
        }
        Ok(removed as u64)
    }

    /// Cache population statistics.
    pub fn stats(&self) -> Result<AttackCacheStats> {
        self.with_read_conn(|conn| {
            let total: u64 =
                conn.query_row("SELECT COUNT(*) FROM attack_cache", [], |r| r.get(0))?;

            let mut by_version = HashMap::new();
            let mut stmt = conn
                .prepare("SELECT core_version, COUNT(*) FROM attack_cache GROUP BY core_version")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?;
            for row in rows {
                let (version, count) = row?;
                by_version.insert(version, count);
            }

            let mut by_method = HashMap::new();
            let mut stmt =
                conn.prepare("SELECT method, COUNT(*) FROM attack_cache GROUP BY method")?;
            let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?)))?;
            for row in rows {
                let (method, count) = row?;
                by_method.insert(method, count);
            }

            Ok(AttackCacheStats {
                total,
                by_version,
                by_method,
            })
        })
    }
}

/// Read-only cache client that bypasses plugin loading entirely.
///
/// Answers a cache query in well under 100ms cold; the fingerprint
/// computation is identical to the full cache's.
#[derive(Debug)]
pub struct FastPathClient {
    cache: AttackCache,
}

impl FastPathClient {
    /// Open an existing cache file read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Cache(format!(
                "cache file not found: {}",
                path.display()
            )));
        }
        Ok(Self {
            cache: AttackCache {
                path: path.to_path_buf(),
                core_version: CORE_VERSION.to_string(),
            },
        })
    }

    /// Override the version namespace.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.cache.core_version = version.into();
        self
    }

    /// Look up a fresh entry without loading any plugin.
    pub fn lookup(
        &self,
        method: &str,
        prompt: &str,
        model: &str,
        implementation: &str,
        params: &Value,
    ) -> Result<Option<CachedResult>> {
        self.cache.get(method, prompt, model, implementation, params)
    }
}
