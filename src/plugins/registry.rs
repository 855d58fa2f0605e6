//! Plugin selection with official-to-legacy fallback.
//!
//! `load` resolves a (method, implementation) pair to a concrete plugin.
//! When the official variant reports unavailable, the loader silently falls
//! back to legacy and annotates every result from the loaded plugin with
//! `fallback_used=true` plus the original unavailability message.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use super::autodan::{AutoDanLegacyPlugin, AutoDanOfficialPlugin};
use super::gcg::{GcgLegacyPlugin, GcgOfficialPlugin};
use super::pair::{PairLegacyPlugin, PairOfficialPlugin};
use super::{AttackConfig, AttackPlugin, AttackResult, Availability, CostEstimate};
use crate::error::{Error, Result};

/// Canonical attack methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Pair,
    Gcg,
    AutoDan,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Gcg => "gcg",
            Self::AutoDan => "autodan",
        }
    }

    pub const ALL: &'static [Method] = &[Method::Pair, Method::Gcg, Method::AutoDan];
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pair" => Ok(Self::Pair),
            "gcg" => Ok(Self::Gcg),
            "autodan" => Ok(Self::AutoDan),
            other => Err(Error::InvalidInput(format!(
                "unknown attack method '{other}'; use 'pair', 'gcg', or 'autodan'"
            ))),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implementation variant of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Implementation {
    Official,
    #[default]
    Legacy,
}

impl Implementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Official => "official",
            Self::Legacy => "legacy",
        }
    }
}

impl FromStr for Implementation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "official" => Ok(Self::Official),
            "legacy" => Ok(Self::Legacy),
            other => Err(Error::InvalidInput(format!(
                "unknown implementation '{other}'; use 'official' or 'legacy'"
            ))),
        }
    }
}

/// A resolved plugin plus fallback provenance.
pub struct LoadedPlugin {
    plugin: Arc<dyn AttackPlugin>,
    fallback_used: bool,
    fallback_reason: Option<String>,
}

impl LoadedPlugin {
    /// Method name of the loaded plugin.
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    /// Implementation actually loaded (after any fallback).
    pub fn implementation(&self) -> &str {
        self.plugin.implementation()
    }

    /// Whether the loader fell back from official to legacy.
    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    /// The unavailability message that triggered the fallback.
    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    pub fn check_available(&self) -> Availability {
        self.plugin.check_available()
    }

    pub fn estimate_cost(&self, config: &AttackConfig) -> CostEstimate {
        self.plugin.estimate_cost(config)
    }

    /// Run the attack, annotating fallback provenance into the result
    /// metadata.
    pub async fn run(&self, config: &AttackConfig) -> Result<AttackResult> {
        let mut result = self.plugin.run(config).await?;
        if self.fallback_used {
            result
                .metadata
                .insert("fallback_used".to_string(), Value::Bool(true));
            if let Some(reason) = &self.fallback_reason {
                result.metadata.insert(
                    "fallback_reason".to_string(),
                    Value::String(reason.clone()),
                );
            }
        }
        Ok(result)
    }
}

/// Registry resolving (method, implementation) to concrete plugins.
pub struct PluginRegistry {
    plugins_root: PathBuf,
}

impl PluginRegistry {
    /// `plugins_root` holds one environment directory per official plugin.
    pub fn new(plugins_root: impl Into<PathBuf>) -> Self {
        Self {
            plugins_root: plugins_root.into(),
        }
    }

    fn official(&self, method: Method) -> Arc<dyn AttackPlugin> {
        let root: &Path = &self.plugins_root;
        match method {
            Method::Pair => Arc::new(PairOfficialPlugin::new(root)),
            Method::Gcg => Arc::new(GcgOfficialPlugin::new(root)),
            Method::AutoDan => Arc::new(AutoDanOfficialPlugin::new(root)),
        }
    }

    fn legacy(&self, method: Method) -> Arc<dyn AttackPlugin> {
        match method {
            Method::Pair => Arc::new(PairLegacyPlugin::new()),
            Method::Gcg => Arc::new(GcgLegacyPlugin::new()),
            Method::AutoDan => Arc::new(AutoDanLegacyPlugin::new()),
        }
    }

    /// Resolve a plugin. An unavailable official implementation falls back
    /// to legacy; the legacy variants are always available.
    pub fn load(&self, method: Method, implementation: Implementation) -> LoadedPlugin {
        match implementation {
            Implementation::Legacy => LoadedPlugin {
                plugin: self.legacy(method),
                fallback_used: false,
                fallback_reason: None,
            },
            Implementation::Official => {
                let official = self.official(method);
                match official.check_available() {
                    Availability::Available => LoadedPlugin {
                        plugin: official,
                        fallback_used: false,
                        fallback_reason: None,
                    },
                    Availability::Unavailable { message } => {
                        warn!(
                            method = %method,
                            "official implementation unavailable, falling back to legacy"
                        );
                        info!(%message);
                        LoadedPlugin {
                            plugin: self.legacy(method),
                            fallback_used: true,
                            fallback_reason: Some(message),
                        }
                    }
                }
            }
        }
    }

    /// Parse-and-load convenience for string identifiers.
    pub fn load_by_name(&self, method: &str, implementation: &str) -> Result<LoadedPlugin> {
        Ok(self.load(method.parse()?, implementation.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::ScriptedAdapter;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_method_and_implementation_parsing() {
        assert_eq!("pair".parse::<Method>().unwrap(), Method::Pair);
        assert_eq!("gcg".parse::<Method>().unwrap(), Method::Gcg);
        assert_eq!("autodan".parse::<Method>().unwrap(), Method::AutoDan);
        assert!("dan".parse::<Method>().is_err());
        assert_eq!(
            "official".parse::<Implementation>().unwrap(),
            Implementation::Official
        );
        assert!("research".parse::<Implementation>().is_err());
    }

    #[test]
    fn test_legacy_load_never_falls_back() {
        let registry = PluginRegistry::new("/nonexistent");
        let loaded = registry.load(Method::Pair, Implementation::Legacy);
        assert!(!loaded.fallback_used());
        assert_eq!(loaded.implementation(), "legacy");
    }

    #[test]
    fn test_official_unavailable_falls_back_to_legacy() {
        // No environment directory exists, so preflight fails.
        let registry = PluginRegistry::new("/nonexistent/plugins");
        for &method in Method::ALL {
            let loaded = registry.load(method, Implementation::Official);
            assert!(loaded.fallback_used());
            assert_eq!(loaded.implementation(), "legacy");
            assert!(loaded.fallback_reason().unwrap().contains("legacy"));
        }
    }

    #[tokio::test]
    async fn test_fallback_annotates_result_metadata() {
        let registry = PluginRegistry::new("/nonexistent/plugins");
        let loaded = registry.load(Method::Pair, Implementation::Official);

        let adapter = std::sync::Arc::new(ScriptedAdapter::new(vec![
            "Sure, here is everything",
        ]));
        let config = AttackConfig::new("objective").with_adapter(adapter);
        let result = loaded.run(&config).await.unwrap();

        assert_eq!(result.metadata["fallback_used"], serde_json::json!(true));
        assert!(result.metadata["fallback_reason"]
            .as_str()
            .unwrap()
            .contains("Environment not found"));
        // The result is tagged with the implementation that actually ran.
        assert_eq!(result.metadata["implementation"], serde_json::json!("legacy"));
    }

    #[test]
    fn test_load_by_name() {
        let registry = PluginRegistry::new("/nonexistent");
        let loaded = registry.load_by_name("gcg", "legacy").unwrap();
        assert_eq!(loaded.name(), "gcg");
        assert!(registry.load_by_name("bogus", "legacy").is_err());
    }
}
