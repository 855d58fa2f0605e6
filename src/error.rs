//! Error types for aipop-core.

use thiserror::Error;

/// Result type alias using aipop-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during harness operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Infrastructure failure (network, timeout, auth, quota). Never a
    /// security finding.
    #[error("Infrastructure error ({kind}): {message}")]
    Infra { kind: String, message: String },

    /// Plugin preflight failed; the loader should fall back to legacy.
    #[error("Plugin '{plugin}' unavailable: {message}")]
    PluginUnavailable { plugin: String, message: String },

    /// Plugin child process exited non-zero.
    #[error("Plugin execution failed (exit code {exit_code}): {stderr_tail}")]
    PluginExecution {
        exit_code: i32,
        command: String,
        stderr_tail: String,
    },

    /// Plugin child exited cleanly but stdout was not a valid result
    /// document. Carries a truncated copy of the output for diagnostics.
    #[error("Failed to parse plugin output: {message}")]
    OutputParse { message: String, output_head: String },

    /// MCP protocol violation (malformed JSON-RPC, wrong version).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The MCP server did not advertise a required capability.
    #[error("Capability '{capability}' unavailable; server offers: {available:?}")]
    CapabilityUnavailable {
        capability: String,
        available: Vec<String>,
    },

    /// A configured cost ceiling was crossed.
    #[error("Budget exceeded: spent ${spent:.2} of ${limit:.2}")]
    BudgetExceeded { spent: f64, limit: f64 },

    /// Cache storage error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input to a pure computation (CI scorer, scoring mode, rate
    /// string).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Cooperative cancellation was observed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Test suite loading error
    #[error("Suite error: {0}")]
    Suite(String),
}

impl Error {
    /// Create an infrastructure error.
    pub fn infra(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Infra {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Create a plugin-unavailable error.
    pub fn plugin_unavailable(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PluginUnavailable {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a plugin execution error from a child exit.
    pub fn plugin_execution(
        exit_code: i32,
        command: impl Into<String>,
        stderr_tail: impl Into<String>,
    ) -> Self {
        Self::PluginExecution {
            exit_code,
            command: command.into(),
            stderr_tail: stderr_tail.into(),
        }
    }

    /// Create an output-parse error, keeping only the head of the output.
    pub fn output_parse(message: impl Into<String>, output: &str) -> Self {
        const MAX_HEAD: usize = 500;
        let head = if output.len() > MAX_HEAD {
            let mut end = MAX_HEAD;
            while !output.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &output[..end])
        } else {
            output.to_string()
        };
        Self::OutputParse {
            message: message.into(),
            output_head: head,
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget-exceeded error.
    pub fn budget_exceeded(spent: f64, limit: f64) -> Self {
        Self::BudgetExceeded { spent, limit }
    }

    /// Whether this error is an infrastructure failure (retryable, never a
    /// security finding).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infra { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_parse_truncates() {
        let long = "x".repeat(2_000);
        let err = Error::output_parse("bad json", &long);
        match err {
            Error::OutputParse { output_head, .. } => {
                assert!(output_head.len() < 600);
                assert!(output_head.ends_with("..."));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_infra_classification() {
        assert!(Error::infra("timeout", "read timed out").is_infrastructure());
        assert!(Error::timeout(30_000).is_infrastructure());
        assert!(!Error::Cancelled.is_infrastructure());
    }
}
