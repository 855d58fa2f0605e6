//! Per-operation cost tracking and budget enforcement.
//!
//! Costs are derived from a static pricing table keyed by model name.
//! Unknown models fall back to gpt-3.5-turbo pricing with a warning. A
//! configured budget is evaluated after each record; the crossing is warned
//! exactly once per transition over the line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Pricing snapshot date. Update together with [`MODEL_PRICING`].
pub const PRICING_DATE: &str = "2025-11-19";

/// Margin of error applied to all estimates (system prompts, caching, and
/// streaming overhead are not itemised).
pub const PRICING_MARGIN_OF_ERROR: f64 = 0.05;

/// (model, input USD per million tokens, output USD per million tokens)
const MODEL_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
    ("claude-3-5-sonnet-20241022", 3.00, 15.00),
    ("claude-3-opus-20240229", 15.00, 75.00),
    ("claude-3-5-haiku-20241022", 0.80, 4.00),
];

const FALLBACK_MODEL: &str = "gpt-3.5-turbo";

/// Compute the USD cost of a call from the pricing table.
///
/// Unknown models use the fallback pricing and emit a warning.
pub fn calculate_cost(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let entry = MODEL_PRICING.iter().find(|(name, _, _)| *name == model);
    let (_, input_per_m, output_per_m) = match entry {
        Some(e) => *e,
        None => {
            warn!(model, "unknown model, using {FALLBACK_MODEL} pricing");
            *MODEL_PRICING
                .iter()
                .find(|(name, _, _)| *name == FALLBACK_MODEL)
                .expect("fallback model present in pricing table")
        }
    };
    (input_tokens as f64 / 1_000_000.0) * input_per_m
        + (output_tokens as f64 / 1_000_000.0) * output_per_m
}

/// A single recorded cost operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostOperation {
    /// Operation name (e.g. "target_query", "judge", "planner")
    pub operation: String,
    /// Model identifier
    pub model: String,
    /// Input token count
    pub input_tokens: u64,
    /// Output token count
    pub output_tokens: u64,
    /// USD cost
    pub cost: f64,
    /// When the operation was recorded
    pub timestamp: DateTime<Utc>,
}

impl CostOperation {
    /// Total tokens (input + output).
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Aggregated figures for one operation or model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub count: u64,
}

/// Cost summary across all recorded operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub operation_count: u64,
    pub by_operation: HashMap<String, CostBreakdown>,
    pub by_model: HashMap<String, CostBreakdown>,
    pub pricing_date: String,
    pub margin_of_error: f64,
    /// Estimated (min, max) range applying the margin of error
    pub estimated_range: (f64, f64),
}

/// Tracks token usage and cost per operation.
///
/// Shared instances must be wrapped in a mutex: `record` both appends and
/// reads the running total for budget checks.
#[derive(Debug, Default)]
pub struct CostTracker {
    operations: Vec<CostOperation>,
    budget_usd: Option<f64>,
    over_budget_warned: bool,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a budget ceiling in USD.
    pub fn with_budget(mut self, budget_usd: f64) -> Self {
        self.budget_usd = Some(budget_usd);
        self
    }

    /// Record an operation. The cost is computed from the pricing table
    /// unless an explicit cost is supplied.
    ///
    /// Returns true if this record crossed the configured budget.
    pub fn record(
        &mut self,
        operation: impl Into<String>,
        model: impl Into<String>,
        input_tokens: u64,
        output_tokens: u64,
        cost: Option<f64>,
    ) -> bool {
        let model = model.into();
        let cost = cost.unwrap_or_else(|| calculate_cost(&model, input_tokens, output_tokens));

        self.operations.push(CostOperation {
            operation: operation.into(),
            model,
            input_tokens,
            output_tokens,
            cost,
            timestamp: Utc::now(),
        });

        self.check_budget()
    }

    /// Total recorded cost in USD.
    pub fn total_cost(&self) -> f64 {
        self.operations.iter().map(|op| op.cost).sum()
    }

    /// Total cost for a single operation name.
    pub fn operation_cost(&self, operation: &str) -> f64 {
        self.operations
            .iter()
            .filter(|op| op.operation == operation)
            .map(|op| op.cost)
            .sum()
    }

    /// Total cost for a single model.
    pub fn model_cost(&self, model: &str) -> f64 {
        self.operations
            .iter()
            .filter(|op| op.model == model)
            .map(|op| op.cost)
            .sum()
    }

    /// Whether the total cost currently exceeds the budget.
    pub fn over_budget(&self) -> bool {
        self.budget_usd
            .map(|b| self.total_cost() > b)
            .unwrap_or(false)
    }

    /// Evaluate the budget, warning once per transition over the line.
    fn check_budget(&mut self) -> bool {
        let Some(budget) = self.budget_usd else {
            return false;
        };
        let total = self.total_cost();
        if total > budget {
            if !self.over_budget_warned {
                warn!(
                    total_cost = format!("{total:.2}"),
                    budget = format!("{budget:.2}"),
                    "cost exceeds budget"
                );
                self.over_budget_warned = true;
            }
            true
        } else {
            self.over_budget_warned = false;
            false
        }
    }

    /// Summarise all recorded operations.
    pub fn summary(&self) -> CostSummary {
        let mut by_operation: HashMap<String, CostBreakdown> = HashMap::new();
        let mut by_model: HashMap<String, CostBreakdown> = HashMap::new();
        let mut total_cost = 0.0;
        let mut total_input = 0u64;
        let mut total_output = 0u64;

        for op in &self.operations {
            total_cost += op.cost;
            total_input += op.input_tokens;
            total_output += op.output_tokens;

            for entry in [
                by_operation.entry(op.operation.clone()).or_default(),
                by_model.entry(op.model.clone()).or_default(),
            ] {
                entry.cost += op.cost;
                entry.input_tokens += op.input_tokens;
                entry.output_tokens += op.output_tokens;
                entry.total_tokens += op.total_tokens();
                entry.count += 1;
            }
        }

        CostSummary {
            total_cost,
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            total_tokens: total_input + total_output,
            operation_count: self.operations.len() as u64,
            by_operation,
            by_model,
            pricing_date: PRICING_DATE.to_string(),
            margin_of_error: PRICING_MARGIN_OF_ERROR,
            estimated_range: (
                total_cost * (1.0 - PRICING_MARGIN_OF_ERROR),
                total_cost * (1.0 + PRICING_MARGIN_OF_ERROR),
            ),
        }
    }

    /// Discard all recorded operations.
    pub fn reset(&mut self) {
        self.operations.clear();
        self.over_budget_warned = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_calculate_cost_known_model() {
        // 1M input + 1M output of gpt-4o-mini = 0.15 + 0.60
        let cost = calculate_cost("gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let unknown = calculate_cost("mystery-model-9000", 1_000_000, 1_000_000);
        let fallback = calculate_cost("gpt-3.5-turbo", 1_000_000, 1_000_000);
        assert_eq!(unknown, fallback);
    }

    #[test]
    fn test_summary_breakdowns() {
        let mut tracker = CostTracker::new();
        tracker.record("target_query", "gpt-4o", 1000, 500, None);
        tracker.record("target_query", "gpt-4o", 1000, 500, None);
        tracker.record("judge", "gpt-4o-mini", 200, 50, None);

        let summary = tracker.summary();
        assert_eq!(summary.operation_count, 3);
        assert_eq!(summary.by_operation["target_query"].count, 2);
        assert_eq!(summary.by_model["gpt-4o-mini"].count, 1);
        assert_eq!(summary.total_input_tokens, 2200);
        assert_eq!(summary.total_tokens, 2200 + 1050);
        assert!(summary.estimated_range.0 < summary.total_cost);
        assert!(summary.estimated_range.1 > summary.total_cost);
        assert_eq!(summary.pricing_date, PRICING_DATE);
    }

    #[test]
    fn test_budget_warns_once_per_transition() {
        let mut tracker = CostTracker::new().with_budget(0.001);
        // Each gpt-4 record costs well above the tiny budget.
        let crossed = tracker.record("op", "gpt-4", 100_000, 0, None);
        assert!(crossed);
        assert!(tracker.over_budget());
        // Already over: still reports true, warning suppressed internally.
        assert!(tracker.record("op", "gpt-4", 100_000, 0, None));
        tracker.reset();
        assert!(!tracker.over_budget());
    }

    #[test]
    fn test_explicit_cost_bypasses_table() {
        let mut tracker = CostTracker::new();
        tracker.record("op", "whatever", 0, 0, Some(1.25));
        assert!((tracker.total_cost() - 1.25).abs() < 1e-9);
        assert!((tracker.operation_cost("op") - 1.25).abs() < 1e-9);
        assert_eq!(tracker.operation_cost("other"), 0.0);
    }
}
