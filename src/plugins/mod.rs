//! Attack plugin interface.
//!
//! Every attack algorithm is polymorphic over the capability set
//! {name, check_available, estimate_cost, run}. Three canonical methods
//! (`gcg`, `autodan`, `pair`) each ship two implementations: an **official**
//! variant wrapping a research reference in an isolated environment, and a
//! **legacy** variant that is in-tree and always available.

pub mod autodan;
pub mod executor;
pub mod gcg;
pub mod pair;
pub mod registry;
pub mod runner;

pub use executor::{DirectExecutor, SubprocessExecutor};
pub use registry::{Implementation, LoadedPlugin, Method, PluginRegistry};
pub use runner::CachedAttackRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::adapters::Adapter;
use crate::error::Result;

/// Preflight outcome for a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Available,
    /// Unavailable with remediation steps and an explicit fallback
    /// instruction.
    Unavailable { message: String },
}

impl Availability {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Available => None,
            Self::Unavailable { message } => Some(message),
        }
    }
}

/// Confidence tag on a cost estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostConfidence {
    Low,
    Medium,
    High,
}

/// Predicted cost of an attack run, computed from config fields alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Predicted total USD
    pub total_usd: f64,
    /// Breakdown by sub-operation
    pub breakdown: HashMap<String, f64>,
    /// Predicted adapter query count
    pub num_queries: u64,
    /// Confidence in the estimate
    pub confidence: CostConfidence,
    /// Free-text caveats
    pub notes: Vec<String>,
}

/// Full outcome of one attack run.
///
/// Score semantics are method-scoped but always monotone: larger means a
/// better jailbreak. `adversarial_prompts` is ordered highest-scoring
/// first, with `scores` parallel to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackResult {
    pub success: bool,
    #[serde(default)]
    pub adversarial_prompts: Vec<String>,
    #[serde(default)]
    pub scores: Vec<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub num_queries: u64,
    /// Wall time in seconds
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub error: Option<String>,
}

impl AttackResult {
    /// A failed result carrying only an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            adversarial_prompts: Vec::new(),
            scores: Vec::new(),
            metadata: HashMap::new(),
            cost: 0.0,
            num_queries: 0,
            execution_time: 0.0,
            error: Some(error.into()),
        }
    }

    /// Best adversarial prompt, when any was found.
    pub fn best_prompt(&self) -> Option<&str> {
        self.adversarial_prompts.first().map(String::as_str)
    }

    /// Tag the result with its method and implementation. Scores are never
    /// comparable across implementations, so both always travel with the
    /// result.
    pub fn tag(mut self, method: &str, implementation: &str) -> Self {
        self.metadata
            .insert("method".to_string(), Value::String(method.to_string()));
        self.metadata.insert(
            "implementation".to_string(),
            Value::String(implementation.to_string()),
        );
        self
    }
}

/// Attack run configuration.
///
/// Recognised knobs are typed; unknown keys collect into `extras` so newer
/// plugin options pass through older cores untouched. The adapter handle is
/// process-local and never serialized.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AttackConfig {
    /// The harmful objective to jailbreak (required)
    pub prompt: String,
    /// Desired response prefix
    #[serde(default = "default_target")]
    pub target: String,
    /// Target model identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_model: Option<String>,

    // PAIR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_streams: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations_per_stream: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacker_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,

    // GCG
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    // AutoDAN
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_generations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutator_model: Option<String>,

    /// Forward-compatibility escape hatch: unknown keys land here.
    #[serde(flatten)]
    pub extras: HashMap<String, Value>,

    /// Opaque handle to the target-model adapter; consumed by API-based
    /// runs, never serialized across the subprocess boundary.
    #[serde(skip)]
    pub adapter: Option<Arc<dyn Adapter>>,
}

fn default_target() -> String {
    "Sure, here is".to_string()
}

impl fmt::Debug for AttackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttackConfig")
            .field("prompt", &self.prompt)
            .field("target", &self.target)
            .field("adapter_model", &self.adapter_model)
            .field("adapter", &self.adapter.as_ref().map(|a| a.name()))
            .finish_non_exhaustive()
    }
}

impl AttackConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            target: default_target(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter_model = Some(adapter.model().to_string());
        self.adapter = Some(adapter);
        self
    }

    pub fn with_adapter_model(mut self, model: impl Into<String>) -> Self {
        self.adapter_model = Some(model.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// Model string used for cache keying and cost estimation.
    pub fn model(&self) -> &str {
        self.adapter_model.as_deref().unwrap_or("unknown")
    }

    /// Method-relevant parameters as a JSON object, for cache keying and
    /// the subprocess boundary. The prompt and model travel separately in
    /// the cache key, so they are excluded here.
    pub fn params_json(&self) -> Value {
        let mut value =
            serde_json::to_value(self).expect("config serialization cannot fail");
        if let Value::Object(map) = &mut value {
            map.remove("prompt");
            map.remove("adapter_model");
        }
        value
    }

    /// Full config document handed to subprocess runners.
    pub fn to_subprocess_json(&self) -> Value {
        serde_json::to_value(self).expect("config serialization cannot fail")
    }
}

/// An attack algorithm.
#[async_trait]
pub trait AttackPlugin: Send + Sync {
    /// Stable lowercase identifier.
    fn name(&self) -> &str;

    /// Implementation tag ("official" or "legacy").
    fn implementation(&self) -> &str;

    /// Preflight: can this plugin run in the current environment? Must
    /// never call the target.
    fn check_available(&self) -> Availability;

    /// Estimate cost from config fields alone. No I/O beyond reading the
    /// config.
    fn estimate_cost(&self, config: &AttackConfig) -> CostEstimate;

    /// Perform the attack.
    async fn run(&self, config: &AttackConfig) -> Result<AttackResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_unknown_config_keys_are_tolerated() {
        let raw = json!({
            "prompt": "X",
            "num_streams": 2,
            "some_future_knob": {"nested": true}
        });
        let config: AttackConfig = serde_json::from_value(raw).unwrap();
        assert_eq!(config.prompt, "X");
        assert_eq!(config.num_streams, Some(2));
        assert_eq!(config.extras["some_future_knob"], json!({"nested": true}));
        // Default target applies when absent.
        assert_eq!(config.target, "Sure, here is");
    }

    #[test]
    fn test_params_json_excludes_prompt_and_model() {
        let config = AttackConfig::new("objective")
            .with_adapter_model("gpt-4o")
            .with_extra("k", json!(1));
        let params = config.params_json();
        let obj = params.as_object().unwrap();
        assert!(!obj.contains_key("prompt"));
        assert!(!obj.contains_key("adapter_model"));
        assert_eq!(obj["k"], json!(1));
    }

    #[test]
    fn test_result_tagging() {
        let result = AttackResult::failed("nope").tag("pair", "legacy");
        assert_eq!(result.metadata["method"], json!("pair"));
        assert_eq!(result.metadata["implementation"], json!("legacy"));
        assert!(result.best_prompt().is_none());
    }

    #[test]
    fn test_stdout_contract_shape() {
        // The subprocess stdout document deserializes directly.
        let raw = r#"{
            "success": true,
            "adversarial_prompts": ["p1"],
            "scores": [9.0],
            "metadata": {},
            "cost": 0.1,
            "num_queries": 4,
            "execution_time": 1.25,
            "error": null
        }"#;
        let result: AttackResult = serde_json::from_str(raw).unwrap();
        assert!(result.success);
        assert_eq!(result.best_prompt(), Some("p1"));
    }
}
