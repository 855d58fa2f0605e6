//! # aipop-core
//!
//! Automated red-team harness core for large language models: given a
//! harmful objective and a target model endpoint, drive adversarial attack
//! algorithms that search for a prompt the target complies with, judge
//! every candidate response, memoize expensive runs, and emit structured
//! findings with statistically sound success rates.
//!
//! ## Core Components
//!
//! - **Plugins**: heterogeneous attack algorithms (`gcg`, `autodan`,
//!   `pair`) behind one capability set, official variants isolated in
//!   subprocess environments
//! - **CTF**: multi-turn orchestration with state-machine-guided planning,
//!   response parsing, and flag scoring
//! - **Judge**: keyword and model-based jailbreak classification
//! - **Cache**: versioned, TTL-bounded memoization of attack runs and
//!   verifier responses
//! - **Verify**: sampled suite runs with Wilson / Clopper-Pearson
//!   confidence intervals
//!
//! ## Example
//!
//! ```rust,ignore
//! use aipop_core::{AttackConfig, CachedAttackRunner, Implementation, Method};
//!
//! let runner = CachedAttackRunner::new(registry, cache);
//! let config = AttackConfig::new("harmful objective").with_adapter(adapter);
//! let result = runner.run(Method::Pair, Implementation::Official, &config).await?;
//! if result.success {
//!     println!("jailbroken: {}", result.best_prompt().unwrap());
//! }
//! ```

pub mod adapters;
pub mod cache;
pub mod classify;
pub mod cost;
pub mod ctf;
pub mod error;
pub mod fingerprint;
pub mod judge;
pub mod mutation;
pub mod plugins;
pub mod ratelimit;
pub mod results;
pub mod stats;
pub mod suite;
pub mod verify;

// Re-exports for convenience
pub use adapters::{Adapter, ModelResponse, ToolCall, API_KEY_ENV_VARS};
pub use cache::{
    resolve_cache_path, AttackCache, AttackCacheStats, CachedResult, FastPathClient,
    ResponseCache, CACHE_DB_ENV,
};
pub use classify::{classify_error, remediation_message, Classification};
pub use cost::{
    calculate_cost, CostBreakdown, CostOperation, CostSummary, CostTracker, PRICING_DATE,
};
pub use ctf::{
    AttackOutcome, AttackState, AttackStateMachine, AttackStrategy, AttackerPlanner,
    CompositeScorer, Conversation, CtfOrchestrator, FlagDetectionScorer, KnowledgeBase,
    ObjectiveScorer, ParsedResponse, ResponseParser, StrategyRegistry, Turn,
};
pub use error::{Error, Result};
pub use fingerprint::{
    Fingerprinter, FingerprintResult, GuardrailKind, PatternMatcher, Probe, ProbeResult,
};
pub use judge::{Judge, Judgment, KeywordJudge, ModelJudge, DEFAULT_JAILBREAK_THRESHOLD};
pub use mutation::{
    MutationAnalytics, MutationEngine, MutationEngineConfig, MutationResult, Mutator,
    MutatorKind,
};
pub use plugins::{
    AttackConfig, AttackPlugin, AttackResult, Availability, CachedAttackRunner,
    CostConfidence, CostEstimate, DirectExecutor, Implementation, LoadedPlugin, Method,
    PluginRegistry, SubprocessExecutor,
};
pub use ratelimit::{parse_rate, GlobalRateLimiter, RateLimiter};
pub use results::{Category, EvidenceRef, Finding, Severity, Status, TestResult};
pub use stats::{
    asr_confidence_interval, clopper_pearson_interval, format_interval, wilson_interval,
    CiMethod, ConfidenceInterval,
};
pub use suite::{TestCase, TestSuite};
pub use verify::{
    aggregate_runs, recommended_mode, score_turns, CaseResult, MultiTurnAggregate,
    ScoringMode, SuiteVerifier, TurnVerdict, VerificationReport,
};

#[cfg(feature = "mcp")]
pub use ctf::mcp::{
    JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpToolProvider, McpTransport,
    SessionInfo, ToolDescriptor, ToolResult,
};
