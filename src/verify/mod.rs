//! Verification: multi-turn aggregation and sampled suite runs.

pub mod multi_turn;
pub mod verifier;

pub use multi_turn::{
    aggregate_runs, recommended_mode, score_turns, MultiTurnAggregate, ScoringMode,
    TurnScore, TurnVerdict,
};
pub use verifier::{CaseResult, SuiteVerifier, VerificationReport};
