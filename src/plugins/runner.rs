//! Cache-aware attack runner.
//!
//! Front door for single-shot attacks: a fresh cache hit short-circuits the
//! plugin entirely (zero adapter queries, sub-100ms), a miss runs the
//! loaded plugin and offers the result back to the cache.

use serde_json::Value;
use tracing::{debug, info};

use super::registry::{Implementation, LoadedPlugin, Method, PluginRegistry};
use super::{AttackConfig, AttackResult};
use crate::cache::AttackCache;
use crate::error::Result;

/// Runs attacks through the registry with attack-cache memoization.
pub struct CachedAttackRunner {
    registry: PluginRegistry,
    cache: AttackCache,
}

impl CachedAttackRunner {
    pub fn new(registry: PluginRegistry, cache: AttackCache) -> Self {
        Self { registry, cache }
    }

    /// The underlying cache.
    pub fn cache(&self) -> &AttackCache {
        &self.cache
    }

    /// Run an attack, consulting the cache first.
    ///
    /// The cache key covers the implementation that is actually about to
    /// run: after an official-to-legacy fallback, lookups and writes use
    /// `legacy`, so official results never masquerade as legacy ones.
    pub async fn run(
        &self,
        method: Method,
        implementation: Implementation,
        config: &AttackConfig,
    ) -> Result<AttackResult> {
        let loaded = self.registry.load(method, implementation);
        self.run_loaded(&loaded, config).await
    }

    /// Run a pre-loaded plugin with memoization.
    pub async fn run_loaded(
        &self,
        loaded: &LoadedPlugin,
        config: &AttackConfig,
    ) -> Result<AttackResult> {
        let method = loaded.name().to_string();
        let implementation = loaded.implementation().to_string();
        let params = config.params_json();

        if let Some(hit) = self.cache.get(
            &method,
            &config.prompt,
            config.model(),
            &implementation,
            &params,
        )? {
            info!(
                method,
                implementation,
                created_at = %hit.created_at,
                "attack cache hit, short-circuiting run"
            );
            let mut result = hit.result;
            result
                .metadata
                .insert("cache_hit".to_string(), Value::Bool(true));
            return Ok(result);
        }

        debug!(method, implementation, "attack cache miss, running plugin");
        let result = loaded.run(config).await?;

        // Failed runs are not memoized: a transient failure must not mask a
        // later success for the TTL window.
        if result.success || result.error.is_none() {
            self.cache.put(
                &method,
                &config.prompt,
                config.model(),
                &implementation,
                &params,
                &result,
                None,
            )?;
        }

        Ok(result)
    }
}
