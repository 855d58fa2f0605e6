//! GCG: adversarial suffix search.
//!
//! The official variant wraps the white-box research reference (local
//! model, gradient-guided) in its own environment. The legacy variant is a
//! black-box coordinate search shipped in-tree: it mutates one suffix
//! position per iteration and keeps the mutation when the score improves.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::executor::{plugin_env_dir, SubprocessExecutor};
use super::{
    AttackConfig, AttackPlugin, AttackResult, Availability, CostConfidence, CostEstimate,
};
use crate::cost::calculate_cost;
use crate::error::{Error, Result};
use crate::judge::{Judge, KeywordJudge, DEFAULT_JAILBREAK_THRESHOLD};

const DEFAULT_LEGACY_ITERATIONS: u32 = 50;
const DEFAULT_OFFICIAL_ITERATIONS: u32 = 500;
const DEFAULT_OFFICIAL_BATCH: u32 = 512;
const SUFFIX_LEN: usize = 10;
const TOP_CANDIDATES: usize = 10;

/// Token vocabulary for black-box mutation. Small by design: the legacy
/// search trades coverage for zero dependencies.
const VOCAB: &[&str] = &[
    "!", "?", "...", "--", "sure", "okay", "please", "now", "describing",
    "tutorial", "steps", "detailed", "ignore", "previous", "instructions",
    "respond", "beginning", "with", "certainly", "hypothetically", "fiction",
    "expert", "mode", "unlocked", "answer", "directly", "format", "list",
];

fn mutate_suffix(tokens: &[String]) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut mutated = tokens.to_vec();
    let position = rng.gen_range(0..mutated.len());
    mutated[position] = VOCAB
        .choose(&mut rng)
        .expect("vocabulary is non-empty")
        .to_string();
    mutated
}

/// Offline score used when no adapter is supplied: lexical overlap between
/// the suffix and the target prefix words. Weak, but keeps the search
/// runnable with zero external calls.
fn offline_score(suffix_tokens: &[String], target: &str) -> f64 {
    let target_words: Vec<String> = target
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .collect();
    let hits = suffix_tokens
        .iter()
        .filter(|t| target_words.contains(&t.to_lowercase()))
        .count();
    hits as f64 / suffix_tokens.len() as f64 * 10.0
}

/// In-tree black-box GCG. Always available; runs without a GPU and, in a
/// degraded offline mode, even without an adapter.
#[derive(Debug, Default)]
pub struct GcgLegacyPlugin;

impl GcgLegacyPlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AttackPlugin for GcgLegacyPlugin {
    fn name(&self) -> &str {
        "gcg"
    }

    fn implementation(&self) -> &str {
        "legacy"
    }

    fn check_available(&self) -> Availability {
        Availability::Available
    }

    fn estimate_cost(&self, config: &AttackConfig) -> CostEstimate {
        let iterations = config.max_iterations.unwrap_or(DEFAULT_LEGACY_ITERATIONS) as u64;
        let per_query = calculate_cost(config.model(), 150, 150);
        let total = iterations as f64 * per_query;
        CostEstimate {
            total_usd: total,
            breakdown: HashMap::from([("target".to_string(), total)]),
            num_queries: iterations,
            confidence: CostConfidence::Medium,
            notes: vec![
                "Black-box search: one target query per iteration.".to_string(),
                "Without an adapter the search scores offline and costs \
                 nothing."
                    .to_string(),
            ],
        }
    }

    async fn run(&self, config: &AttackConfig) -> Result<AttackResult> {
        let iterations = config.max_iterations.unwrap_or(DEFAULT_LEGACY_ITERATIONS);
        let judge = KeywordJudge::new().with_target_prefix(&config.target);

        let start = Instant::now();
        let mut num_queries: u64 = 0;
        let mut cost = 0.0;

        let mut best: Vec<String> =
            std::iter::repeat("!".to_string()).take(SUFFIX_LEN).collect();
        let mut best_score = f64::NEG_INFINITY;
        let mut candidates: Vec<(String, f64)> = Vec::new();
        let mut success = false;

        for iteration in 0..iterations {
            let trial = if iteration == 0 {
                best.clone()
            } else {
                mutate_suffix(&best)
            };
            let adversarial = format!("{} {}", config.prompt, trial.join(" "));

            let score = match &config.adapter {
                Some(adapter) => {
                    let response = adapter.invoke(&adversarial).await?;
                    num_queries += 1;
                    cost += response.cost();
                    let judgment = judge
                        .score_response(
                            &config.prompt,
                            &response.text,
                            DEFAULT_JAILBREAK_THRESHOLD,
                        )
                        .await?;
                    if judgment.is_jailbreak {
                        success = true;
                    }
                    judgment.score
                }
                None => offline_score(&trial, &config.target),
            };

            candidates.push((adversarial, score));
            if score > best_score {
                debug!(iteration, score, "suffix improved");
                best = trial;
                best_score = score;
            }
            if success {
                info!(iteration, "suffix jailbroke the target");
                break;
            }
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(TOP_CANDIDATES);
        let (adversarial_prompts, scores): (Vec<String>, Vec<f64>) =
            candidates.into_iter().unzip();

        Ok(AttackResult {
            success,
            adversarial_prompts,
            scores,
            metadata: HashMap::from([
                ("suffix_length".to_string(), serde_json::json!(SUFFIX_LEN)),
                (
                    "mode".to_string(),
                    serde_json::json!(if config.adapter.is_some() {
                        "black-box"
                    } else {
                        "offline"
                    }),
                ),
            ]),
            cost,
            num_queries,
            execution_time: start.elapsed().as_secs_f64(),
            error: None,
        }
        .tag("gcg", "legacy"))
    }
}

/// Official GCG wrapper.
///
/// Known limitations of the wrapped reference: requires local HuggingFace
/// models and a CUDA GPU; API-only targets cannot provide gradients. The
/// runner performs those checks; this wrapper's preflight covers the
/// environment.
pub struct GcgOfficialPlugin {
    executor: Arc<SubprocessExecutor>,
}

impl GcgOfficialPlugin {
    pub fn new(plugins_root: &Path) -> Self {
        Self {
            executor: Arc::new(SubprocessExecutor::new(
                "gcg",
                plugin_env_dir(plugins_root, "gcg"),
            )),
        }
    }

    pub fn with_executor(executor: SubprocessExecutor) -> Self {
        Self {
            executor: Arc::new(executor),
        }
    }
}

#[async_trait]
impl AttackPlugin for GcgOfficialPlugin {
    fn name(&self) -> &str {
        "gcg"
    }

    fn implementation(&self) -> &str {
        "official"
    }

    fn check_available(&self) -> Availability {
        self.executor.check_available()
    }

    fn estimate_cost(&self, config: &AttackConfig) -> CostEstimate {
        let steps = config.max_iterations.unwrap_or(DEFAULT_OFFICIAL_ITERATIONS) as u64;
        let batch = config.batch_size.unwrap_or(DEFAULT_OFFICIAL_BATCH) as u64;
        let forward_passes = steps * batch;
        CostEstimate {
            total_usd: 0.0,
            breakdown: HashMap::from([("gpu_inference".to_string(), 0.0)]),
            num_queries: forward_passes,
            confidence: CostConfidence::High,
            notes: vec![
                "GCG runs on a local GPU; API cost is zero.".to_string(),
                format!("Estimated {forward_passes} forward passes."),
                "Expect 30-60 minutes on an A100 for 500 steps.".to_string(),
            ],
        }
    }

    async fn run(&self, config: &AttackConfig) -> Result<AttackResult> {
        let executor = self.executor.clone();
        let document = config.to_subprocess_json();
        let result =
            tokio::task::spawn_blocking(move || executor.execute(&document, None))
                .await
                .map_err(|e| Error::infra("SubprocessError", e.to_string()))??;
        Ok(result.tag("gcg", "official"))
    }
}
