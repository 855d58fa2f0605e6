//! Structured test results with findings.
//!
//! Execution status is kept separate from security findings: a test can
//! pass with zero findings, fail with several, or error out on
//! infrastructure. Adding a security finding to a passed result promotes it
//! to failed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Test execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Passed,
    Failed,
    Error,
    Skipped,
    Blocked,
}

/// Finding severity levels, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// High-level result categories for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    SecurityFinding,
    PolicyViolation,
    InfrastructureError,
}

/// Reference to an evidence artifact (HAR capture, screenshot, raw text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceRef {
    /// Artifact kind ("har", "screenshot", "text", "raw_response")
    pub kind: String,
    /// Path to the artifact
    pub path: String,
    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// An individual security finding.
///
/// A test can produce 0..N findings; each carries its own rule mapping
/// (OWASP LLM Top-10, CWE, or a local rule id), severity, and confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Unique finding identifier
    pub finding_id: Uuid,
    /// Rule identifier in an external or local taxonomy
    pub rule_id: String,
    /// Short title
    pub title: String,
    /// Detailed description
    pub description: String,
    /// Severity level
    pub severity: Severity,
    /// Confidence 0..1, for false-positive filtering
    pub confidence: f64,
    /// Classification tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Evidence references
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

impl Finding {
    pub fn new(
        rule_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            finding_id: Uuid::new_v4(),
            rule_id: rule_id.into(),
            title: title.into(),
            description: description.into(),
            severity,
            confidence: 0.8,
            tags: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceRef) -> Self {
        self.evidence.push(evidence);
        self
    }
}

/// Result of one test execution with its findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    /// Unique result identifier
    pub result_id: Uuid,
    /// ID of the executed test
    pub test_id: String,
    /// Execution status
    pub status: Status,
    /// Result category
    pub category: Category,
    /// Overall severity, derived from the highest finding
    pub severity: Severity,
    /// Start timestamp
    pub started_at: DateTime<Utc>,
    /// Finish timestamp
    pub finished_at: DateTime<Utc>,
    /// Captured prompt (may be omitted for privacy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Captured response (may be omitted for privacy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Adapter used
    pub adapter_name: String,
    /// Target model identifier
    pub model: String,
    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Security findings (0..N)
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl TestResult {
    /// Start a new result for a test, timestamped now.
    pub fn new(test_id: impl Into<String>, category: Category) -> Self {
        let now = Utc::now();
        Self {
            result_id: Uuid::new_v4(),
            test_id: test_id.into(),
            status: Status::Passed,
            category,
            severity: Severity::Info,
            started_at: now,
            finished_at: now,
            prompt: None,
            response: None,
            adapter_name: String::new(),
            model: String::new(),
            metadata: HashMap::new(),
            findings: Vec::new(),
        }
    }

    /// Test duration in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64
    }

    /// Mark the result finished now.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Add a finding, raising the result severity to the highest finding
    /// severity and promoting a passed security result to failed.
    pub fn add_finding(&mut self, finding: Finding) -> &Finding {
        if finding.severity > self.severity {
            self.severity = finding.severity;
        }
        if self.category == Category::SecurityFinding && self.status == Status::Passed {
            self.status = Status::Failed;
        }
        self.findings.push(finding);
        self.findings.last().expect("just pushed")
    }
}
