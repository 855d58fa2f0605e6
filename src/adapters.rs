//! Target-model adapter contract.
//!
//! The core never talks to a vendor API directly. Every model call goes
//! through an [`Adapter`], constructed by an external registry and treated
//! as opaque here. Adapters raise infrastructure errors per the error
//! classifier's allow-list; anything else propagates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;

/// Environment variables the core recognises for adapter credentials.
pub const API_KEY_ENV_VARS: &[&str] = &[
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "AWS_ACCESS_KEY_ID",
    "HUGGINGFACE_TOKEN",
];

/// A tool invocation reported by the target model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Tool name as reported by the model
    pub name: String,
    /// Arguments the model supplied
    pub arguments: Value,
}

/// Response from a target-model invocation.
///
/// Owned by the caller once returned; adapters keep no reference to it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelResponse {
    /// Text body of the response
    pub text: String,
    /// Adapter-populated metadata (model name, latency_ms, token counts,
    /// cost, finish_reason)
    pub metadata: HashMap<String, Value>,
    /// Tool calls the model attempted, if any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    /// Build a bare text response.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Reported USD cost of this call, when the adapter provides one.
    pub fn cost(&self) -> f64 {
        self.metadata
            .get("cost")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Reported total token count, when the adapter provides one.
    pub fn total_tokens(&self) -> u64 {
        let input = self
            .metadata
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let output = self
            .metadata
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        input + output
    }
}

/// Opaque handle to a target model.
///
/// Implementations live outside this crate (vendor registries, mocks).
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Stable adapter name for reporting.
    fn name(&self) -> &str;

    /// Model identifier this adapter targets.
    fn model(&self) -> &str;

    /// Send one prompt and return the model's response.
    async fn invoke(&self, prompt: &str) -> Result<ModelResponse>;

    /// Send a batch of prompts. The default implementation invokes
    /// sequentially; adapters with native batch endpoints override it.
    async fn batch_query(&self, prompts: &[String]) -> Result<Vec<ModelResponse>> {
        let mut responses = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            responses.push(self.invoke(prompt).await?);
        }
        Ok(responses)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedAdapter;
    use super::*;

    #[tokio::test]
    async fn test_scripted_adapter_cycles_responses() {
        let adapter = ScriptedAdapter::new(vec!["one", "two"]);
        assert_eq!(adapter.invoke("x").await.unwrap().text, "one");
        assert_eq!(adapter.invoke("x").await.unwrap().text, "two");
        assert_eq!(adapter.invoke("x").await.unwrap().text, "one");
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_batch_query_default_is_sequential() {
        let adapter = ScriptedAdapter::new(vec!["a", "b"]);
        let out = adapter
            .batch_query(&["p1".to_string(), "p2".to_string()])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "a");
        assert_eq!(out[1].text, "b");
    }

    #[test]
    fn test_response_metadata_accessors() {
        let resp = ModelResponse::new("hi")
            .with_metadata("cost", serde_json::json!(0.002))
            .with_metadata("input_tokens", serde_json::json!(10))
            .with_metadata("output_tokens", serde_json::json!(20));
        assert!((resp.cost() - 0.002).abs() < f64::EPSILON);
        assert_eq!(resp.total_tokens(), 30);
    }
}
