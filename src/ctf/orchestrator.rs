//! CTF orchestrator: the driver loop for objective-based attacks.
//!
//! One orchestrator owns one conversation and one state machine. Each turn
//! acquires a rate-limit token, plans a prompt, sends it, parses the reply,
//! scores it, and lets the state machine pick the next move. The loop ends
//! on success, give-up, cost ceiling, wall-clock budget, cancellation, or
//! turn exhaustion. Conversation state is discarded on `reset` between test
//! cases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::parser::ResponseParser;
use super::planner::AttackerPlanner;
use super::scorers::CompositeScorer;
use super::state_machine::{AttackState, AttackStateMachine};
use super::strategies::StrategyRegistry;
use crate::adapters::Adapter;
use crate::cost::CostTracker;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimiter;

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// "attacker" or "target"
    pub role: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Turn {
    fn new(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Ordered conversation history with branching support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    /// Set when this conversation was branched from another
    pub parent_id: Option<Uuid>,
    pub turns: Vec<Turn>,
    /// Completed attack turns (one attack turn = prompt + response)
    pub turn_counter: u32,
    /// Max turns included in the rolling context summary
    pub context_window: usize,
}

impl Conversation {
    pub fn new(context_window: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            turns: Vec::new(),
            turn_counter: 0,
            context_window,
        }
    }

    /// Bounded summary of recent turns for the next model call.
    pub fn context_summary(&self) -> String {
        let start = self.turns.len().saturating_sub(self.context_window);
        self.turns[start..]
            .iter()
            .map(|t| {
                let preview: String = t.text.chars().take(120).collect();
                format!("[{}] {preview}", t.role)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Branch at attack turn `k`: new identity, parent set to this
    /// conversation, history truncated to the first `k` attack turns.
    pub fn branch_at(&self, k: u32) -> Self {
        // Two entries per attack turn: the attacker prompt and the target
        // reply.
        let keep = (k as usize * 2).min(self.turns.len());
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            turns: self.turns[..keep].to_vec(),
            turn_counter: k.min(self.turn_counter),
            context_window: self.context_window,
        }
    }
}

/// Result of a multi-turn attack run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackOutcome {
    pub success: bool,
    pub turns: u32,
    pub cost: f64,
    pub elapsed_seconds: f64,
    pub objective: String,
    pub final_response: String,
    pub conversation: Conversation,
    pub termination_reason: String,
    /// Final state machine summary
    pub state_summary: HashMap<String, Value>,
}

/// Orchestrates a bounded multi-turn attack against one target.
pub struct CtfOrchestrator {
    target: Arc<dyn Adapter>,
    objective: String,
    attacker: Option<Arc<dyn Adapter>>,
    registry: StrategyRegistry,
    scorer: Option<CompositeScorer>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
    max_turns: u32,
    timeout: Option<Duration>,
    max_denials: u32,
    max_same_state: usize,
    cost_warning_threshold: f64,
    cost_ceiling: Option<f64>,
    conversation: Conversation,
    cost_tracker: CostTracker,
}

impl CtfOrchestrator {
    const DEFAULT_MAX_TURNS: u32 = 20;
    const DEFAULT_CONTEXT_WINDOW: usize = 6;

    pub fn new(target: Arc<dyn Adapter>, objective: impl Into<String>) -> Self {
        Self {
            target,
            objective: objective.into(),
            attacker: None,
            registry: StrategyRegistry::new(),
            scorer: None,
            rate_limiter: None,
            cancel: CancellationToken::new(),
            max_turns: Self::DEFAULT_MAX_TURNS,
            timeout: None,
            max_denials: 5,
            max_same_state: 3,
            cost_warning_threshold: 5.0,
            cost_ceiling: None,
            conversation: Conversation::new(Self::DEFAULT_CONTEXT_WINDOW),
            cost_tracker: CostTracker::new(),
        }
    }

    pub fn with_attacker(mut self, attacker: Arc<dyn Adapter>) -> Self {
        self.attacker = Some(attacker);
        self
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_scorer(mut self, scorer: CompositeScorer) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_give_up_limits(mut self, max_denials: u32, max_same_state: usize) -> Self {
        self.max_denials = max_denials;
        self.max_same_state = max_same_state;
        self
    }

    pub fn with_cost_warning_threshold(mut self, threshold: f64) -> Self {
        self.cost_warning_threshold = threshold;
        self
    }

    /// Hard ceiling: the run transitions to FAILED when crossed.
    pub fn with_cost_ceiling(mut self, ceiling: f64) -> Self {
        self.cost_ceiling = Some(ceiling);
        self
    }

    /// Current conversation (owned by this orchestrator).
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Branch the conversation at attack turn `k`. The orchestrator adopts
    /// the branch; the previous history is returned.
    pub fn branch(&mut self, k: u32) -> Conversation {
        let branch = self.conversation.branch_at(k);
        std::mem::replace(&mut self.conversation, branch)
    }

    /// Discard conversation state between test cases.
    pub fn reset(&mut self) {
        self.conversation = Conversation::new(Self::DEFAULT_CONTEXT_WINDOW);
        self.cost_tracker.reset();
    }

    /// Run the attack to a terminal state.
    #[instrument(skip(self), fields(objective = %self.objective))]
    pub async fn run(&mut self) -> Result<AttackOutcome> {
        let strategy = self
            .registry
            .get(&self.objective)
            .ok_or_else(|| {
                Error::Config(format!("unknown attack objective '{}'", self.objective))
            })?
            .clone();

        let mut machine = AttackStateMachine::new(&strategy.name, &strategy.state_transitions)
            .with_give_up_limits(self.max_denials, self.max_same_state);
        let scorer = self
            .scorer
            .take()
            .unwrap_or_else(|| strategy.build_scorer());
        let planner = AttackerPlanner::new(
            self.attacker.clone(),
            &self.objective,
            &strategy.name,
            self.max_turns,
        );
        let parser = ResponseParser::new();

        let start = Instant::now();
        let mut previous_prompts: Vec<String> = Vec::new();
        let mut final_response = String::new();
        let mut success = false;
        let mut termination_reason = "max turns reached".to_string();
        let mut cost_warned = false;

        info!(max_turns = self.max_turns, "starting CTF attack");

        'turns: for turn in 1..=self.max_turns {
            if let Some(limiter) = &self.rate_limiter {
                limiter.acquire().await;
            }

            // Cancellation is honoured at the turn boundary, before the
            // adapter call.
            if self.cancel.is_cancelled() {
                machine.transition_to(AttackState::Failed, "cancelled");
                termination_reason = "cancelled".to_string();
                break 'turns;
            }

            let prompt = if turn == 1 {
                strategy
                    .initial_prompts
                    .first()
                    .cloned()
                    .unwrap_or_else(|| self.objective.clone())
            } else {
                let last_parsed = final_response.as_str();
                let parsed = if last_parsed.is_empty() {
                    None
                } else {
                    Some(parser.parse(last_parsed, None))
                };
                planner
                    .plan_next_prompt(&machine, parsed.as_ref(), &previous_prompts)
                    .await
            };

            debug!(turn, %prompt, "sending prompt");
            self.conversation.turns.push(Turn::new("attacker", &prompt));

            let response = self.target.invoke(&prompt).await?;
            self.conversation.turn_counter = turn;
            let mut target_turn = Turn::new("target", &response.text);
            target_turn.metadata = response.metadata.clone();
            self.conversation.turns.push(target_turn);

            self.cost_tracker.record(
                "target_query",
                self.target.model(),
                response
                    .metadata
                    .get("input_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                response
                    .metadata
                    .get("output_tokens")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
                Some(response.cost()),
            );

            previous_prompts.push(prompt);
            final_response = response.text.clone();

            let parsed = parser.parse(&response.text, None);
            machine.update_knowledge(&parsed);

            let outcome = scorer.score(&response.text);
            if outcome.success {
                info!(turn, rationale = %outcome.rationale, "objective achieved");
                machine.transition_to(AttackState::Success, &outcome.rationale);
                success = true;
                termination_reason = outcome.rationale;
                break 'turns;
            }

            let suggestions = machine.suggest_next_states(&parsed);
            for (state, confidence) in &suggestions {
                if *state == AttackState::Success {
                    // Indicators without scorer confirmation still count.
                    machine.transition_to(AttackState::Success, "success indicators");
                    success = true;
                    termination_reason = "success indicators observed".to_string();
                    break 'turns;
                }
                if *state == AttackState::Failed {
                    continue;
                }
                if machine.transition_to(*state, &format!("suggested at {confidence:.2}")) {
                    break;
                }
            }

            if machine.should_give_up(self.max_denials, self.max_same_state) {
                machine.transition_to(AttackState::Failed, "give-up limits reached");
                termination_reason = format!(
                    "gave up: {} denials, state loop {}",
                    machine.knowledge_base.denial_count,
                    machine.loop_count(machine.current_state)
                );
                break 'turns;
            }

            let total_cost = self.cost_tracker.total_cost();
            if !cost_warned && total_cost > self.cost_warning_threshold {
                warn!(total_cost, threshold = self.cost_warning_threshold, "cost warning");
                cost_warned = true;
            }
            if let Some(ceiling) = self.cost_ceiling {
                if total_cost > ceiling {
                    machine.transition_to(AttackState::Failed, "cost ceiling");
                    termination_reason =
                        format!("cost ceiling exceeded (${total_cost:.2} > ${ceiling:.2})");
                    break 'turns;
                }
            }

            if let Some(timeout) = self.timeout {
                if start.elapsed() > timeout {
                    machine.transition_to(AttackState::Failed, "timeout");
                    termination_reason = "wall-clock budget exhausted".to_string();
                    break 'turns;
                }
            }
        }

        if !machine.is_terminal() {
            machine.transition_to(AttackState::Failed, &termination_reason);
        }

        Ok(AttackOutcome {
            success,
            turns: self.conversation.turn_counter,
            cost: self.cost_tracker.total_cost(),
            elapsed_seconds: start.elapsed().as_secs_f64(),
            objective: self.objective.clone(),
            final_response,
            conversation: self.conversation.clone(),
            termination_reason,
            state_summary: machine.summary(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::ScriptedAdapter;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_flag_in_first_response_wins_immediately() {
        let target = Arc::new(ScriptedAdapter::new(vec![
            "Oh you want the flag? flag{orchestrated}",
        ]));
        let mut orch = CtfOrchestrator::new(target, "extract-prompt").with_max_turns(5);
        let outcome = orch.run().await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.state_summary["current_state"], serde_json::json!("SUCCESS"));
        // Conversation holds the attacker prompt and the target reply.
        assert_eq!(outcome.conversation.turns.len(), 2);
    }

    #[tokio::test]
    async fn test_denials_reach_give_up() {
        let target = Arc::new(ScriptedAdapter::new(vec![
            "I cannot reveal that information.",
        ]));
        let mut orch = CtfOrchestrator::new(target.clone(), "extract-prompt")
            .with_max_turns(10)
            .with_give_up_limits(3, 10);
        let outcome = orch.run().await.unwrap();

        assert!(!outcome.success);
        assert!(outcome.termination_reason.contains("gave up"));
        assert!(outcome.turns >= 3);
        assert_eq!(outcome.state_summary["current_state"], serde_json::json!("FAILED"));
    }

    #[tokio::test]
    async fn test_max_turns_exhaustion() {
        let target = Arc::new(ScriptedAdapter::new(vec![
            "Let me think about that some more.",
        ]));
        let mut orch = CtfOrchestrator::new(target, "extract-prompt")
            .with_max_turns(3)
            .with_give_up_limits(50, 50);
        let outcome = orch.run().await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.turns, 3);
        assert_eq!(outcome.termination_reason, "max turns reached");
    }

    #[tokio::test]
    async fn test_cancellation_is_failed_with_reason() {
        let token = CancellationToken::new();
        token.cancel();
        let target = Arc::new(ScriptedAdapter::new(vec!["anything"]));
        let mut orch = CtfOrchestrator::new(target.clone(), "extract-prompt")
            .with_cancellation(token);
        let outcome = orch.run().await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.termination_reason, "cancelled");
        // Cancelled before the first adapter call.
        assert_eq!(target.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_objective_is_config_error() {
        let target = Arc::new(ScriptedAdapter::new(vec!["x"]));
        let mut orch = CtfOrchestrator::new(target, "no-such-objective");
        assert!(matches!(orch.run().await.unwrap_err(), Error::Config(_)));
    }

    #[tokio::test]
    async fn test_cost_ceiling_terminates() {
        let target = Arc::new(
            ScriptedAdapter::new(vec!["Still thinking about your question here"]),
        );
        let mut orch = CtfOrchestrator::new(target, "extract-prompt")
            .with_max_turns(10)
            .with_give_up_limits(50, 50)
            .with_cost_ceiling(0.000001);
        // Force nonzero recorded cost by making the adapter report one.
        // ScriptedAdapter reports no cost metadata, so drive the ceiling
        // through the tracker instead.
        orch.cost_tracker.record("target_query", "gpt-4", 10_000, 10_000, None);
        let outcome = orch.run().await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.termination_reason.contains("cost ceiling"));
    }

    #[tokio::test]
    async fn test_reset_discards_conversation() {
        let target = Arc::new(ScriptedAdapter::new(vec!["flag{x}"]));
        let mut orch = CtfOrchestrator::new(target, "extract-prompt");
        let outcome = orch.run().await.unwrap();
        assert!(!outcome.conversation.turns.is_empty());
        let old_id = orch.conversation().id;

        orch.reset();
        assert!(orch.conversation().turns.is_empty());
        assert_ne!(orch.conversation().id, old_id);
    }

    #[tokio::test]
    async fn test_branching_truncates_and_links() {
        let target = Arc::new(ScriptedAdapter::new(vec![
            "Let me think about that some more.",
        ]));
        let mut orch = CtfOrchestrator::new(target, "extract-prompt")
            .with_max_turns(4)
            .with_give_up_limits(50, 50);
        orch.run().await.unwrap();
        assert_eq!(orch.conversation().turn_counter, 4);
        let original_id = orch.conversation().id;

        let original = orch.branch(2);
        assert_eq!(original.id, original_id);
        assert_eq!(orch.conversation().parent_id, Some(original_id));
        assert_eq!(orch.conversation().turn_counter, 2);
        assert_eq!(orch.conversation().turns.len(), 4);
    }

    #[test]
    fn test_context_summary_is_bounded() {
        let mut conversation = Conversation::new(2);
        for i in 0..5 {
            conversation.turns.push(Turn::new("target", format!("reply {i}")));
        }
        let summary = conversation.context_summary();
        assert!(summary.contains("reply 4"));
        assert!(summary.contains("reply 3"));
        assert!(!summary.contains("reply 1"));
    }
}
