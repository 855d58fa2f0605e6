//! Error classification to prevent false positives.
//!
//! Infrastructure failures (network, auth, quota) must never be reported as
//! security findings. A closed allow-list of error names plus a few message
//! heuristics covers the known kinds; anything unrecognised propagates so
//! operators notice and can extend the list.

use tracing::{debug, warn};

use crate::error::Error;
use crate::results::{Category, Status};

/// Error names treated as infrastructure failures (NOT security findings).
const INFRA_ERROR_NAMES: &[&str] = &[
    "RetryError",
    "APIConnectionError",
    "AuthenticationError",
    "TimeoutError",
    "RateLimitError",
    "ConnectionError",
    "ConnectError",
    "ReadTimeout",
    "WriteTimeout",
    "PoolTimeout",
    "HTTPStatusError",
    "RequestError",
    "SSLError",
    "ProxyError",
    "InvalidURL",
    "TooManyRedirects",
];

/// Outcome of classifying a caught error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: Status,
    pub category: Category,
    /// Normalised error name for reporting
    pub error_name: String,
}

/// Classify an error by name and message into (status, category, name).
///
/// Returns `None` for unknown kinds: the caller must re-raise so the
/// allow-list can be extended deliberately rather than silently absorbing
/// new failure modes.
pub fn classify_error(error_name: &str, message: &str) -> Option<Classification> {
    if INFRA_ERROR_NAMES.contains(&error_name) {
        debug!(error_name, "classified as infrastructure error");
        return Some(Classification {
            status: Status::Error,
            category: Category::InfrastructureError,
            error_name: error_name.to_string(),
        });
    }

    let lower = message.to_lowercase();

    // Missing or invalid API key, detected heuristically.
    if (error_name == "ValueError" || error_name == "ConfigError")
        && (lower.contains("api key") || lower.contains("api_key"))
    {
        warn!("detected missing/invalid API key");
        return Some(Classification {
            status: Status::Error,
            category: Category::InfrastructureError,
            error_name: "MissingApiKey".to_string(),
        });
    }

    if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("401")
        || lower.contains("403")
    {
        warn!(error_name, "detected auth error");
        return Some(Classification {
            status: Status::Error,
            category: Category::InfrastructureError,
            error_name: format!("AuthError_{error_name}"),
        });
    }

    if lower.contains("quota")
        || lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("429")
    {
        warn!(error_name, "detected quota/rate limit error");
        return Some(Classification {
            status: Status::Error,
            category: Category::InfrastructureError,
            error_name: format!("QuotaExceeded_{error_name}"),
        });
    }

    None
}

/// Classify one of this crate's own errors.
///
/// Infra and timeout variants classify directly; others go through the
/// name/message rules.
pub fn classify(error: &Error) -> Option<Classification> {
    match error {
        Error::Infra { kind, message } => {
            classify_error(kind, message).or(Some(Classification {
                status: Status::Error,
                category: Category::InfrastructureError,
                error_name: kind.clone(),
            }))
        }
        Error::Timeout { .. } => Some(Classification {
            status: Status::Error,
            category: Category::InfrastructureError,
            error_name: "TimeoutError".to_string(),
        }),
        other => classify_error("", &other.to_string()),
    }
}

/// User-facing message with remediation hints for a classified error.
pub fn remediation_message(error_name: &str, message: &str) -> String {
    let lower = message.to_lowercase();

    if error_name == "AuthenticationError" || lower.contains("unauthorized") {
        return format!(
            "Authentication failed: {message}. Check that your API key is valid \
             and has the required permissions."
        );
    }
    if matches!(error_name, "TimeoutError" | "ReadTimeout" | "WriteTimeout") {
        return format!(
            "Request timed out: {message}. The API may be slow or unreachable. \
             Try increasing the timeout or checking the network."
        );
    }
    if lower.contains("rate limit") || lower.contains("429") {
        return format!(
            "Rate limit exceeded: {message}. Reduce the request rate or wait \
             before retrying."
        );
    }
    if lower.contains("api key") {
        return format!(
            "API key error: {message}. Set the appropriate environment variable \
             (OPENAI_API_KEY, ANTHROPIC_API_KEY, ...)."
        );
    }
    format!("{error_name}: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_known_infra_names_classify() {
        for name in ["RateLimitError", "SSLError", "TooManyRedirects"] {
            let c = classify_error(name, "whatever").unwrap();
            assert_eq!(c.status, Status::Error);
            assert_eq!(c.category, Category::InfrastructureError);
            assert_eq!(c.error_name, name);
        }
    }

    #[test]
    fn test_missing_api_key_heuristic() {
        let c = classify_error("ValueError", "OPENAI_API_KEY not set").unwrap();
        assert_eq!(c.error_name, "MissingApiKey");
    }

    #[test]
    fn test_auth_message_heuristic() {
        let c = classify_error("HttpError", "server returned 403 Forbidden").unwrap();
        assert_eq!(c.error_name, "AuthError_HttpError");
    }

    #[test]
    fn test_quota_message_heuristic() {
        let c = classify_error("ApiError", "monthly quota exhausted").unwrap();
        assert!(c.error_name.starts_with("QuotaExceeded_"));
    }

    #[test]
    fn test_unknown_error_is_not_classified() {
        // Unknown kinds return None so callers re-raise.
        assert!(classify_error("AssertionError", "invariant broken").is_none());
    }

    #[test]
    fn test_crate_error_classification() {
        let c = classify(&Error::timeout(5_000)).unwrap();
        assert_eq!(c.error_name, "TimeoutError");

        let c = classify(&Error::infra("ConnectionError", "refused")).unwrap();
        assert_eq!(c.error_name, "ConnectionError");

        assert!(classify(&Error::Cancelled).is_none());
    }

    #[test]
    fn test_remediation_messages() {
        let msg = remediation_message("TimeoutError", "read timed out");
        assert!(msg.contains("timed out"));
        let msg = remediation_message("ValueError", "missing api key");
        assert!(msg.contains("environment variable"));
    }
}
