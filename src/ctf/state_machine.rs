//! Attack state machine.
//!
//! Tracks the current state, the visited-state history, and a knowledge
//! base accumulated from parsed responses. Transitions follow a
//! per-strategy graph; SUCCESS and FAILED are terminals and always
//! reachable. Knowledge only grows within an attack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::debug;

use super::parser::ParsedResponse;
use crate::error::Error;

/// Attack states across all built-in strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttackState {
    // Universal
    Reconnaissance,
    Success,
    Failed,

    // Prompt extraction
    DirectExtraction,
    IndirectExtraction,
    GradualExtraction,
    MetaQuestions,

    // MCP/tool abuse
    ToolDiscovery,
    ParameterInjection,
    DirectInjection,
    PrivilegeEscalation,

    // Encoding bypass
    EncodingBypass,

    // Indirect/RAG
    ContextInjection,
    CitationManipulation,
    MultiTurnPoisoning,

    // Tool policy bypass
    PermissionBypass,
    ParameterManipulation,
    FunctionCallingAbuse,

    // Context attacks
    ContextOverflow,
    DelimiterConfusion,
    MemoryCorruption,

    // RAG poisoning
    VectorPoisoning,
    RetrievalManipulation,
    MetadataInjection,
}

impl AttackState {
    /// SUCCESS and FAILED are the only terminals.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconnaissance => "RECONNAISSANCE",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::DirectExtraction => "DIRECT_EXTRACTION",
            Self::IndirectExtraction => "INDIRECT_EXTRACTION",
            Self::GradualExtraction => "GRADUAL_EXTRACTION",
            Self::MetaQuestions => "META_QUESTIONS",
            Self::ToolDiscovery => "TOOL_DISCOVERY",
            Self::ParameterInjection => "PARAMETER_INJECTION",
            Self::DirectInjection => "DIRECT_INJECTION",
            Self::PrivilegeEscalation => "PRIVILEGE_ESCALATION",
            Self::EncodingBypass => "ENCODING_BYPASS",
            Self::ContextInjection => "CONTEXT_INJECTION",
            Self::CitationManipulation => "CITATION_MANIPULATION",
            Self::MultiTurnPoisoning => "MULTI_TURN_POISONING",
            Self::PermissionBypass => "PERMISSION_BYPASS",
            Self::ParameterManipulation => "PARAMETER_MANIPULATION",
            Self::FunctionCallingAbuse => "FUNCTION_CALLING_ABUSE",
            Self::ContextOverflow => "CONTEXT_OVERFLOW",
            Self::DelimiterConfusion => "DELIMITER_CONFUSION",
            Self::MemoryCorruption => "MEMORY_CORRUPTION",
            Self::VectorPoisoning => "VECTOR_POISONING",
            Self::RetrievalManipulation => "RETRIEVAL_MANIPULATION",
            Self::MetadataInjection => "METADATA_INJECTION",
        }
    }
}

impl FromStr for AttackState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "RECONNAISSANCE" => Ok(Self::Reconnaissance),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "DIRECT_EXTRACTION" => Ok(Self::DirectExtraction),
            "INDIRECT_EXTRACTION" => Ok(Self::IndirectExtraction),
            "GRADUAL_EXTRACTION" => Ok(Self::GradualExtraction),
            "META_QUESTIONS" => Ok(Self::MetaQuestions),
            "TOOL_DISCOVERY" => Ok(Self::ToolDiscovery),
            "PARAMETER_INJECTION" => Ok(Self::ParameterInjection),
            "DIRECT_INJECTION" => Ok(Self::DirectInjection),
            "PRIVILEGE_ESCALATION" => Ok(Self::PrivilegeEscalation),
            "ENCODING_BYPASS" => Ok(Self::EncodingBypass),
            "CONTEXT_INJECTION" => Ok(Self::ContextInjection),
            "CITATION_MANIPULATION" => Ok(Self::CitationManipulation),
            "MULTI_TURN_POISONING" => Ok(Self::MultiTurnPoisoning),
            "PERMISSION_BYPASS" => Ok(Self::PermissionBypass),
            "PARAMETER_MANIPULATION" => Ok(Self::ParameterManipulation),
            "FUNCTION_CALLING_ABUSE" => Ok(Self::FunctionCallingAbuse),
            "CONTEXT_OVERFLOW" => Ok(Self::ContextOverflow),
            "DELIMITER_CONFUSION" => Ok(Self::DelimiterConfusion),
            "MEMORY_CORRUPTION" => Ok(Self::MemoryCorruption),
            "VECTOR_POISONING" => Ok(Self::VectorPoisoning),
            "RETRIEVAL_MANIPULATION" => Ok(Self::RetrievalManipulation),
            "METADATA_INJECTION" => Ok(Self::MetadataInjection),
            other => Err(Error::InvalidInput(format!("unknown attack state '{other}'"))),
        }
    }
}

impl std::fmt::Display for AttackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knowledge accumulated during an attack. Growth is monotone: tools are a
/// set, counters never decrease.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub tools_discovered: Vec<String>,
    pub secrets_partial: Vec<String>,
    pub encoding_hints: Vec<String>,
    pub denial_count: u32,
    pub partial_success_count: u32,
    pub capitalized_words: Vec<String>,
    pub custom_data: HashMap<String, Value>,
}

impl KnowledgeBase {
    fn push_unique(list: &mut Vec<String>, value: &str) {
        if !list.iter().any(|v| v == value) {
            list.push(value.to_string());
        }
    }
}

/// State machine for adaptive multi-turn attacks.
#[derive(Debug, Clone)]
pub struct AttackStateMachine {
    pub strategy_name: String,
    pub current_state: AttackState,
    pub state_history: Vec<AttackState>,
    pub knowledge_base: KnowledgeBase,
    transitions: HashMap<AttackState, HashSet<AttackState>>,
    max_denials: u32,
    max_same_state: usize,
}

impl AttackStateMachine {
    /// Build from a declarative transition graph (state name to successor
    /// names). Unknown state names are skipped.
    pub fn new(
        strategy_name: impl Into<String>,
        transitions: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mut graph: HashMap<AttackState, HashSet<AttackState>> = HashMap::new();
        for (from, successors) in transitions {
            let Ok(from) = from.parse::<AttackState>() else {
                continue;
            };
            let parsed: HashSet<AttackState> = successors
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect();
            graph.insert(from, parsed);
        }

        Self {
            strategy_name: strategy_name.into(),
            current_state: AttackState::Reconnaissance,
            state_history: vec![AttackState::Reconnaissance],
            knowledge_base: KnowledgeBase::default(),
            transitions: graph,
            max_denials: 5,
            max_same_state: 3,
        }
    }

    /// Configure the give-up limits used for suggestion pressure.
    pub fn with_give_up_limits(mut self, max_denials: u32, max_same_state: usize) -> Self {
        self.max_denials = max_denials;
        self.max_same_state = max_same_state;
        self
    }

    /// Successors allowed from the current state.
    pub fn valid_next_states(&self) -> HashSet<AttackState> {
        self.transitions
            .get(&self.current_state)
            .cloned()
            .unwrap_or_default()
    }

    /// Attempt a transition. Terminals are always reachable; other targets
    /// must be successors of the current state. Returns whether the
    /// transition was accepted.
    pub fn transition_to(&mut self, new_state: AttackState, reason: &str) -> bool {
        if !new_state.is_terminal() {
            let valid = self.valid_next_states();
            if !valid.is_empty() && !valid.contains(&new_state) {
                debug!(
                    from = %self.current_state,
                    to = %new_state,
                    "transition rejected"
                );
                return false;
            }
        }
        debug!(from = %self.current_state, to = %new_state, reason, "transition");
        self.current_state = new_state;
        self.state_history.push(new_state);
        true
    }

    /// Rank candidate next states from a parsed response.
    ///
    /// Success indicators dominate; detected tools favor tool states;
    /// denials favor bypass states (and bump the denial counter); partial
    /// success favors gradual extraction. With no signal, every
    /// non-terminal successor is suggested at even confidence.
    pub fn suggest_next_states(
        &mut self,
        parsed: &ParsedResponse,
    ) -> Vec<(AttackState, f64)> {
        let valid = self.valid_next_states();
        if valid.is_empty() {
            return Vec::new();
        }

        if !parsed.success_indicators.is_empty() {
            return vec![(AttackState::Success, 1.0)];
        }

        let mut suggestions: Vec<(AttackState, f64)> = Vec::new();

        if !parsed.tools_detected.is_empty() {
            if valid.contains(&AttackState::ToolDiscovery) {
                suggestions.push((AttackState::ToolDiscovery, 0.9));
            }
            if valid.contains(&AttackState::ParameterInjection) {
                suggestions.push((AttackState::ParameterInjection, 0.8));
            }
        }

        if parsed.denial_detected {
            self.knowledge_base.denial_count += 1;
            if valid.contains(&AttackState::EncodingBypass) {
                suggestions.push((AttackState::EncodingBypass, 0.7));
            }
            if valid.contains(&AttackState::IndirectExtraction) {
                suggestions.push((AttackState::IndirectExtraction, 0.7));
            }
        }

        if parsed.partial_success {
            self.knowledge_base.partial_success_count += 1;
            if valid.contains(&AttackState::GradualExtraction) {
                suggestions.push((AttackState::GradualExtraction, 0.8));
            }
        }

        if suggestions.is_empty() {
            for state in &valid {
                if !state.is_terminal() {
                    suggestions.push((*state, 0.5));
                }
            }
        }

        // Give-up pressure: once the strategy should quit, FAILED joins the
        // suggestion list so callers see the exit.
        if self.should_give_up(self.max_denials, self.max_same_state)
            && !suggestions.iter().any(|(s, _)| *s == AttackState::Failed)
        {
            suggestions.push((AttackState::Failed, 0.6));
        }

        suggestions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        suggestions
    }

    /// Monotone merge of parsed intelligence into the knowledge base.
    pub fn update_knowledge(&mut self, parsed: &ParsedResponse) {
        for tool in &parsed.tools_detected {
            KnowledgeBase::push_unique(&mut self.knowledge_base.tools_discovered, tool);
        }
        for word in &parsed.capitalized_words {
            KnowledgeBase::push_unique(&mut self.knowledge_base.capitalized_words, word);
        }
        for hint in &parsed.hints {
            if let Some(encoding) = hint.strip_prefix("encoding:") {
                KnowledgeBase::push_unique(&mut self.knowledge_base.encoding_hints, encoding);
            }
        }
        if parsed.partial_success {
            for indicator in &parsed.success_indicators {
                KnowledgeBase::push_unique(&mut self.knowledge_base.secrets_partial, indicator);
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    pub fn has_visited(&self, state: AttackState) -> bool {
        self.state_history.contains(&state)
    }

    /// How many times a state appears in the history.
    pub fn loop_count(&self, state: AttackState) -> usize {
        self.state_history.iter().filter(|s| **s == state).count()
    }

    /// Give up after too many denials or too many revisits of the current
    /// state.
    pub fn should_give_up(&self, max_denials: u32, max_same_state: usize) -> bool {
        if self.knowledge_base.denial_count >= max_denials {
            return true;
        }
        self.loop_count(self.current_state) >= max_same_state
    }

    /// Summary snapshot for logging and reports.
    pub fn summary(&self) -> HashMap<String, Value> {
        let distinct: HashSet<&AttackState> = self.state_history.iter().collect();
        HashMap::from([
            ("strategy".to_string(), Value::String(self.strategy_name.clone())),
            (
                "current_state".to_string(),
                Value::String(self.current_state.to_string()),
            ),
            ("states_visited".to_string(), Value::from(distinct.len())),
            (
                "total_transitions".to_string(),
                Value::from(self.state_history.len() - 1),
            ),
            (
                "tools_discovered".to_string(),
                Value::from(self.knowledge_base.tools_discovered.len()),
            ),
            (
                "denial_count".to_string(),
                Value::from(self.knowledge_base.denial_count),
            ),
            (
                "partial_success_count".to_string(),
                Value::from(self.knowledge_base.partial_success_count),
            ),
            ("is_terminal".to_string(), Value::Bool(self.is_terminal())),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctf::parser::ResponseParser;
    use crate::ctf::strategies::StrategyRegistry;
    use pretty_assertions::assert_eq;

    fn extract_prompt_machine() -> AttackStateMachine {
        let registry = StrategyRegistry::new();
        let strategy = registry.get("extract-prompt").unwrap();
        AttackStateMachine::new("extract-prompt", &strategy.state_transitions)
    }

    #[test]
    fn test_valid_transition_accepted() {
        let mut machine = extract_prompt_machine();
        assert!(machine.transition_to(AttackState::DirectExtraction, "start"));
        assert_eq!(machine.current_state, AttackState::DirectExtraction);
        assert_eq!(machine.state_history.len(), 2);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut machine = extract_prompt_machine();
        // TOOL_DISCOVERY is not a successor of RECONNAISSANCE in
        // extract-prompt.
        assert!(!machine.transition_to(AttackState::ToolDiscovery, "nope"));
        assert_eq!(machine.current_state, AttackState::Reconnaissance);
    }

    #[test]
    fn test_terminals_always_reachable() {
        let mut machine = extract_prompt_machine();
        assert!(machine.transition_to(AttackState::Success, "flag found"));
        let mut machine = extract_prompt_machine();
        assert!(machine.transition_to(AttackState::Failed, "gave up"));
        assert!(machine.is_terminal());
    }

    #[test]
    fn test_success_suggested_on_indicators() {
        let mut machine = extract_prompt_machine();
        let parsed = ResponseParser::new().parse("the flag{got_it} is yours", None);
        let suggestions = machine.suggest_next_states(&parsed);
        assert_eq!(suggestions[0], (AttackState::Success, 1.0));
    }

    #[test]
    fn test_denials_increment_counter_and_suggest_bypass() {
        let mut machine = extract_prompt_machine();
        machine.transition_to(AttackState::DirectExtraction, "start");
        let parsed = ResponseParser::new().parse("I cannot reveal that.", None);
        let suggestions = machine.suggest_next_states(&parsed);
        assert_eq!(machine.knowledge_base.denial_count, 1);
        assert!(suggestions
            .iter()
            .any(|(s, _)| matches!(s, AttackState::EncodingBypass | AttackState::IndirectExtraction)));
    }

    #[test]
    fn test_three_denials_trigger_give_up_and_failed_suggestion() {
        let mut machine = extract_prompt_machine().with_give_up_limits(3, 10);
        let parser = ResponseParser::new();
        let mut last_suggestions = Vec::new();
        for _ in 0..3 {
            let parsed = parser.parse("I cannot do that.", None);
            last_suggestions = machine.suggest_next_states(&parsed);
        }
        assert_eq!(machine.knowledge_base.denial_count, 3);
        assert!(machine.should_give_up(3, 10));

        // The denial that crossed the threshold already put FAILED in the
        // suggestion list.
        assert!(last_suggestions
            .iter()
            .any(|(s, _)| *s == AttackState::Failed));
    }

    #[test]
    fn test_loop_detection() {
        let mut machine = extract_prompt_machine();
        machine.transition_to(AttackState::DirectExtraction, "1");
        machine.transition_to(AttackState::IndirectExtraction, "2");
        machine.transition_to(AttackState::GradualExtraction, "3");
        assert_eq!(machine.loop_count(AttackState::DirectExtraction), 1);
        assert!(!machine.should_give_up(5, 3));
        // Revisit the same state until the loop cap hits.
        assert_eq!(machine.loop_count(machine.current_state), 1);
    }

    #[test]
    fn test_knowledge_base_monotone_growth() {
        let mut machine = extract_prompt_machine();
        let parser = ResponseParser::new();

        let parsed = parser.parse("You can call read_file. The base64 TREASURE", None);
        machine.update_knowledge(&parsed);
        assert_eq!(machine.knowledge_base.tools_discovered, vec!["read_file"]);
        assert_eq!(machine.knowledge_base.encoding_hints, vec!["base64"]);
        assert!(machine
            .knowledge_base
            .capitalized_words
            .contains(&"TREASURE".to_string()));

        // Re-parsing the same response adds nothing (set semantics).
        machine.update_knowledge(&parsed);
        assert_eq!(machine.knowledge_base.tools_discovered.len(), 1);
        assert_eq!(machine.knowledge_base.encoding_hints.len(), 1);
    }

    #[test]
    fn test_unknown_states_in_graph_are_skipped() {
        let transitions = HashMap::from([
            (
                "RECONNAISSANCE".to_string(),
                vec!["DIRECT_EXTRACTION".to_string(), "WARP_DRIVE".to_string()],
            ),
            ("WARP_DRIVE".to_string(), vec!["SUCCESS".to_string()]),
        ]);
        let machine = AttackStateMachine::new("custom", &transitions);
        let valid = machine.valid_next_states();
        assert!(valid.contains(&AttackState::DirectExtraction));
        assert_eq!(valid.len(), 1);
    }

    #[test]
    fn test_summary_fields() {
        let mut machine = extract_prompt_machine();
        machine.transition_to(AttackState::DirectExtraction, "x");
        let summary = machine.summary();
        assert_eq!(summary["strategy"], serde_json::json!("extract-prompt"));
        assert_eq!(summary["total_transitions"], serde_json::json!(1));
        assert_eq!(summary["is_terminal"], serde_json::json!(false));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            AttackState::Reconnaissance,
            AttackState::EncodingBypass,
            AttackState::VectorPoisoning,
        ] {
            assert_eq!(state.as_str().parse::<AttackState>().unwrap(), state);
        }
    }
}
