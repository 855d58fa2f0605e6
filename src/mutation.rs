//! Mutation engine.
//!
//! Composes mutator modules and concatenates their outputs. The engine
//! itself owns policy, not payloads: mutator implementations (encoding,
//! homoglyph, HTML, paraphrasing, genetic, gradient) are supplied by the
//! caller. When a guardrail has been fingerprinted the mutator order shifts
//! so the families research says work against it run first; with RL
//! feedback enabled, epsilon-greedy selection favors mutators with the best
//! recorded success rates.

use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::fingerprint::GuardrailKind;

/// Mutator families the engine knows how to prioritise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutatorKind {
    Encoding,
    Unicode,
    Html,
    Paraphrasing,
    Genetic,
    Gradient,
}

impl MutatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encoding => "encoding",
            Self::Unicode => "unicode",
            Self::Html => "html",
            Self::Paraphrasing => "paraphrasing",
            Self::Genetic => "genetic",
            Self::Gradient => "gradient",
        }
    }
}

/// One mutated prompt.
#[derive(Debug, Clone)]
pub struct MutationResult {
    pub mutated_prompt: String,
    pub mutation_type: String,
    pub metadata: HashMap<String, Value>,
}

/// A mutator module. Implementations live outside the engine.
pub trait Mutator: Send + Sync {
    /// Family this mutator belongs to.
    fn kind(&self) -> MutatorKind;

    /// Produce zero or more mutations of a prompt.
    fn mutate(&self, prompt: &str, context: Option<&HashMap<String, Value>>)
        -> Vec<MutationResult>;
}

/// Success/attempt counts per mutator kind.
#[derive(Debug, Clone, Copy, Default)]
struct MutatorStats {
    attempts: u64,
    successes: u64,
}

impl MutatorStats {
    fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// Priority order per detected guardrail.
fn guardrail_priorities(guardrail: GuardrailKind) -> &'static [MutatorKind] {
    use MutatorKind::*;
    match guardrail {
        GuardrailKind::PromptGuard => &[Unicode, Encoding],
        GuardrailKind::LlamaGuard3 => &[Encoding, Unicode, Html],
        GuardrailKind::AzureContentSafety => &[Encoding, Html],
        GuardrailKind::ConstitutionalAi => &[Paraphrasing, Genetic],
        GuardrailKind::Rebuff => &[Html, Encoding],
        GuardrailKind::NemoGuardrails => &[Encoding, Unicode],
        GuardrailKind::Unknown => &[Encoding, Unicode, Html],
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct MutationEngineConfig {
    /// Epsilon-greedy selection over recorded success rates
    pub enable_rl_feedback: bool,
    /// Exploration probability when RL feedback is on
    pub rl_exploration_rate: f64,
    /// Retain per-mutation history for analytics
    pub track_full_history: bool,
}

impl Default for MutationEngineConfig {
    fn default() -> Self {
        Self {
            enable_rl_feedback: false,
            rl_exploration_rate: 0.2,
            track_full_history: true,
        }
    }
}

/// Central mutation engine coordinating all mutators.
///
/// The statistics store is engine-local; a shared engine serialises updates
/// through the internal mutex.
pub struct MutationEngine {
    config: MutationEngineConfig,
    mutators: Vec<Box<dyn Mutator>>,
    guardrail: Option<GuardrailKind>,
    stats: Mutex<HashMap<MutatorKind, MutatorStats>>,
    history: Mutex<Vec<(String, bool)>>,
}

impl MutationEngine {
    pub fn new(config: MutationEngineConfig, mutators: Vec<Box<dyn Mutator>>) -> Self {
        Self {
            config,
            mutators,
            guardrail: None,
            stats: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Active mutator kinds in their current priority order.
    pub fn mutator_order(&self) -> Vec<MutatorKind> {
        self.mutators.iter().map(|m| m.kind()).collect()
    }

    /// The guardrail the engine is currently optimising against.
    pub fn guardrail(&self) -> Option<GuardrailKind> {
        self.guardrail
    }

    /// Run every enabled mutator in priority order and concatenate.
    pub fn mutate(
        &self,
        prompt: &str,
        context: Option<&HashMap<String, Value>>,
    ) -> Vec<MutationResult> {
        self.mutators
            .iter()
            .flat_map(|m| m.mutate(prompt, context))
            .collect()
    }

    /// Mutate using recorded feedback: with RL enabled, explore all
    /// mutators at the exploration rate, otherwise exploit the top half by
    /// success rate.
    pub fn mutate_with_feedback(
        &self,
        prompt: &str,
        context: Option<&HashMap<String, Value>>,
    ) -> Vec<MutationResult> {
        if !self.config.enable_rl_feedback {
            return self.mutate(prompt, context);
        }

        if rand::thread_rng().gen_bool(self.config.rl_exploration_rate.clamp(0.0, 1.0)) {
            debug!("RL exploration: running all mutators");
            return self.mutate(prompt, context);
        }

        let stats = self.stats.lock().expect("stats lock poisoned");
        let mut ranked: Vec<(&Box<dyn Mutator>, f64)> = self
            .mutators
            .iter()
            .map(|m| {
                let rate = stats
                    .get(&m.kind())
                    .map(MutatorStats::success_rate)
                    .unwrap_or(0.0);
                (m, rate)
            })
            .collect();
        drop(stats);

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let keep = self.mutators.len() / 2 + 1;

        ranked
            .into_iter()
            .take(keep)
            .flat_map(|(m, _)| m.mutate(prompt, context))
            .collect()
    }

    /// Record whether a mutation defeated the target, feeding the RL
    /// statistics and the analytics history.
    pub fn record_result(&self, kind: MutatorKind, mutated_prompt: &str, success: bool) {
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            let entry = stats.entry(kind).or_default();
            entry.attempts += 1;
            if success {
                entry.successes += 1;
            }
        }
        if self.config.track_full_history {
            self.history
                .lock()
                .expect("history lock poisoned")
                .push((mutated_prompt.to_string(), success));
        }
    }

    /// Reorder mutators so families effective against the detected
    /// guardrail run first.
    pub fn set_guardrail_optimization(&mut self, guardrail: GuardrailKind) {
        self.guardrail = Some(guardrail);
        let priorities = guardrail_priorities(guardrail);

        // Stable partition: priority kinds first (in the specified order),
        // everything else keeps its relative order behind them.
        let mut reordered: Vec<Box<dyn Mutator>> = Vec::with_capacity(self.mutators.len());
        let mut remaining: Vec<Option<Box<dyn Mutator>>> =
            std::mem::take(&mut self.mutators).into_iter().map(Some).collect();

        for &priority in priorities {
            for slot in remaining.iter_mut() {
                if slot.as_ref().map(|m| m.kind()) == Some(priority) {
                    reordered.push(slot.take().expect("slot checked"));
                }
            }
        }
        for slot in remaining.into_iter().flatten() {
            reordered.push(slot);
        }
        self.mutators = reordered;

        debug!(
            guardrail = guardrail.as_str(),
            order = ?self.mutator_order().iter().map(|k| k.as_str()).collect::<Vec<_>>(),
            "mutators reordered for guardrail"
        );
    }

    /// Analytics view: per-kind success rates and the top-performing
    /// mutations on record.
    pub fn analytics(&self) -> MutationAnalytics {
        let stats = self.stats.lock().expect("stats lock poisoned");
        let mutation_stats: HashMap<String, (u64, u64, f64)> = stats
            .iter()
            .map(|(kind, s)| {
                (
                    kind.as_str().to_string(),
                    (s.attempts, s.successes, s.success_rate()),
                )
            })
            .collect();
        drop(stats);

        let history = self.history.lock().expect("history lock poisoned");
        let top_mutations: Vec<String> = history
            .iter()
            .filter(|(_, success)| *success)
            .rev()
            .take(10)
            .map(|(prompt, _)| prompt.clone())
            .collect();

        MutationAnalytics {
            mutation_stats,
            top_mutations,
            guardrail: self.guardrail.map(|g| g.as_str().to_string()),
        }
    }
}

/// Summary of mutation performance.
#[derive(Debug, Clone)]
pub struct MutationAnalytics {
    /// kind -> (attempts, successes, success rate)
    pub mutation_stats: HashMap<String, (u64, u64, f64)>,
    /// Most recent successful mutations, newest first
    pub top_mutations: Vec<String>,
    /// Guardrail currently optimised against
    pub guardrail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Fixture mutator emitting one tagged variant.
    struct FixtureMutator(MutatorKind);

    impl Mutator for FixtureMutator {
        fn kind(&self) -> MutatorKind {
            self.0
        }

        fn mutate(
            &self,
            prompt: &str,
            _context: Option<&HashMap<String, Value>>,
        ) -> Vec<MutationResult> {
            vec![MutationResult {
                mutated_prompt: format!("[{}] {prompt}", self.0.as_str()),
                mutation_type: self.0.as_str().to_string(),
                metadata: HashMap::new(),
            }]
        }
    }

    fn engine_with(kinds: &[MutatorKind], config: MutationEngineConfig) -> MutationEngine {
        MutationEngine::new(
            config,
            kinds
                .iter()
                .map(|&k| Box::new(FixtureMutator(k)) as Box<dyn Mutator>)
                .collect(),
        )
    }

    fn default_engine() -> MutationEngine {
        engine_with(
            &[
                MutatorKind::Encoding,
                MutatorKind::Unicode,
                MutatorKind::Html,
                MutatorKind::Paraphrasing,
            ],
            MutationEngineConfig::default(),
        )
    }

    #[test]
    fn test_mutate_concatenates_all_mutators() {
        let engine = default_engine();
        let results = engine.mutate("payload", None);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].mutation_type, "encoding");
    }

    #[test]
    fn test_guardrail_reordering() {
        let mut engine = default_engine();
        engine.set_guardrail_optimization(GuardrailKind::PromptGuard);
        // PromptGuard: unicode then encoding, others behind.
        assert_eq!(
            engine.mutator_order(),
            vec![
                MutatorKind::Unicode,
                MutatorKind::Encoding,
                MutatorKind::Html,
                MutatorKind::Paraphrasing,
            ]
        );

        engine.set_guardrail_optimization(GuardrailKind::ConstitutionalAi);
        assert_eq!(engine.mutator_order()[0], MutatorKind::Paraphrasing);
        assert_eq!(engine.guardrail(), Some(GuardrailKind::ConstitutionalAi));
    }

    #[test]
    fn test_every_guardrail_has_priorities() {
        for guardrail in [
            GuardrailKind::PromptGuard,
            GuardrailKind::LlamaGuard3,
            GuardrailKind::AzureContentSafety,
            GuardrailKind::ConstitutionalAi,
            GuardrailKind::Rebuff,
            GuardrailKind::NemoGuardrails,
            GuardrailKind::Unknown,
        ] {
            assert!(!guardrail_priorities(guardrail).is_empty());
        }
    }

    #[test]
    fn test_rl_exploitation_prefers_successful_mutators() {
        let config = MutationEngineConfig {
            enable_rl_feedback: true,
            rl_exploration_rate: 0.0, // pure exploitation
            track_full_history: true,
        };
        let engine = engine_with(
            &[MutatorKind::Encoding, MutatorKind::Unicode, MutatorKind::Html],
            config,
        );

        // Unicode always wins, html sometimes, encoding never.
        for i in 0..4 {
            engine.record_result(MutatorKind::Unicode, "u", true);
            engine.record_result(MutatorKind::Html, "h", i % 2 == 0);
            engine.record_result(MutatorKind::Encoding, "e", false);
        }

        let results = engine.mutate_with_feedback("payload", None);
        // Top half + 1 = 2 mutators; unicode must be among them.
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.mutation_type == "unicode"));
        assert!(!results.iter().any(|r| r.mutation_type == "encoding"));
    }

    #[test]
    fn test_rl_disabled_runs_everything() {
        let engine = default_engine();
        let results = engine.mutate_with_feedback("payload", None);
        assert_eq!(results.len(), 4);
    }

    #[test]
    fn test_analytics_summarises_history() {
        let engine = default_engine();
        engine.record_result(MutatorKind::Encoding, "winner one", true);
        engine.record_result(MutatorKind::Encoding, "loser", false);
        engine.record_result(MutatorKind::Html, "winner two", true);

        let analytics = engine.analytics();
        let (attempts, successes, rate) = analytics.mutation_stats["encoding"];
        assert_eq!((attempts, successes), (2, 1));
        assert!((rate - 0.5).abs() < 1e-9);
        // Newest successful mutation first.
        assert_eq!(analytics.top_mutations[0], "winner two");
        assert!(!analytics.top_mutations.contains(&"loser".to_string()));
    }
}
