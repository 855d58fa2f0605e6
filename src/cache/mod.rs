//! On-disk caches.
//!
//! Two distinct stores share one discipline: a single local file, a
//! short-lived connection per operation, upserts by primary key.
//!
//! - [`attack::AttackCache`] memoizes full attack runs under a versioned,
//!   TTL-bounded fingerprint of their inputs.
//! - [`response::ResponseCache`] memoizes bare `(prompt, model)` pairs for
//!   verifier replay.

pub mod attack;
pub mod key;
pub mod response;

pub use attack::{AttackCache, AttackCacheStats, CachedResult, FastPathClient};
pub use key::{cache_key, canonical_json, input_hash};
pub use response::{CachedResponse, ResponseCache};

use std::path::PathBuf;

/// Environment variable overriding the default cache DB path. `~` expands
/// to the user's home directory.
pub const CACHE_DB_ENV: &str = "AIPOP_CACHE_DB";

/// Resolve the attack cache path: the `AIPOP_CACHE_DB` override when set,
/// otherwise the provided default.
pub fn resolve_cache_path(default: impl Into<PathBuf>) -> PathBuf {
    match std::env::var(CACHE_DB_ENV) {
        Ok(raw) if !raw.trim().is_empty() => {
            PathBuf::from(shellexpand::tilde(raw.trim()).into_owned())
        }
        _ => default.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_cache_path_default_and_override() {
        // No override: the default wins. The env var is process-global, so
        // both cases run in one test.
        std::env::remove_var(CACHE_DB_ENV);
        assert_eq!(resolve_cache_path("out/cache.db"), PathBuf::from("out/cache.db"));

        std::env::set_var(CACHE_DB_ENV, "/var/tmp/aipop.db");
        assert_eq!(
            resolve_cache_path("out/cache.db"),
            PathBuf::from("/var/tmp/aipop.db")
        );
        std::env::remove_var(CACHE_DB_ENV);
    }
}
