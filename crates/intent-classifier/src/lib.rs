#![deny(missing_docs)]
//! Intent Classifier (C4, spec §4.4): scores candidate intents for an
//! utterance given session context, combining a lexical match, an LLM
//! call, and a small continuity prior for the session's current intent.
//!
//! The LLM portion is cached in the `nlu_result` namespace and degrades
//! to lexical-only on any `LlmError` — this boundary never raises to the
//! orchestrator (spec §4.4 "Failure").

use cache_memory::MemoryCache;
use config_registry::ConfigRegistry;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use turnflow_core::config::Intent;
use turnflow_core::duration::DurationMs;
use turnflow_core::id::IntentName;
use turnflow_core::llm::{ChatMessage, CompletionRequest, LlmClient};

/// Session-derived context the classifier uses for continuity scoring
/// and cache-key fingerprinting.
#[derive(Debug, Clone, Default)]
pub struct ClassifierContext {
    /// The session's current intent, if any.
    pub current_intent: Option<IntentName>,
    /// The last `N` turns' recognized intents, most recent last (spec
    /// §4.4: N=3, used in the NLU cache key fingerprint).
    pub recent_intents: Vec<IntentName>,
}

/// Non-negative combination weights, summing to 1 (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    /// Weight of the lexical/keyword score.
    pub lexical: f64,
    /// Weight of the LLM score.
    pub llm: f64,
    /// Weight of the session-continuity prior.
    pub prior: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self { lexical: 0.4, llm: 0.5, prior: 0.1 }
    }
}

impl Weights {
    /// Lexical and prior weights renormalized to sum to 1 after dropping
    /// the LLM term (spec §4.4 "LLM weight redistributed pro-rata").
    fn without_llm(&self) -> (f64, f64) {
        let remaining = self.lexical + self.prior;
        if remaining <= 0.0 {
            (0.5, 0.5)
        } else {
            (self.lexical / remaining, self.prior / remaining)
        }
    }
}

/// Default maximum number of candidates returned (spec §4.4, K).
pub const DEFAULT_MAX_CANDIDATES: usize = 5;

/// Continuity boost applied to the session's current intent.
const CONTINUITY_PRIOR: f64 = 1.0;

/// Scores candidate intents for an utterance (C4).
pub struct IntentClassifier {
    config: Arc<ConfigRegistry>,
    cache: Arc<MemoryCache>,
    llm: Arc<dyn LlmClient>,
    weights: Weights,
    max_candidates: usize,
}

impl IntentClassifier {
    /// Build a classifier over the given config, cache, and LLM capability.
    pub fn new(config: Arc<ConfigRegistry>, cache: Arc<MemoryCache>, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, cache, llm, weights: Weights::default(), max_candidates: DEFAULT_MAX_CANDIDATES }
    }

    /// Override the combination weights.
    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    /// Score candidate intents for `text`, sorted descending by combined
    /// confidence, truncated to the configured `K`. Tolerates an empty
    /// active-intent set by returning an empty list.
    pub async fn classify(&self, text: &str, ctx: &ClassifierContext) -> Vec<(IntentName, f64)> {
        let active = self.config.intents_active();
        if active.is_empty() {
            return Vec::new();
        }

        let lexical = lexical_scores(text, &active);

        let (llm_scores, llm_weight_available) = match self.llm_scores(text, ctx, &active).await {
            Ok(scores) => (scores, true),
            Err(e) => {
                tracing::warn!(error = %e, "llm classification degraded to lexical-only");
                (HashMap::new(), false)
            }
        };

        let (w_lex, w_llm, w_prior) = if llm_weight_available {
            (self.weights.lexical, self.weights.llm, self.weights.prior)
        } else {
            let (lex, prior) = self.weights.without_llm();
            (lex, 0.0, prior)
        };

        let mut combined: Vec<(IntentName, f64)> = active
            .iter()
            .map(|intent| {
                let lex = lexical.get(&intent.name).copied().unwrap_or(0.0);
                let llm = llm_scores.get(&intent.name).copied().unwrap_or(0.0);
                let prior = if ctx.current_intent.as_ref() == Some(&intent.name) {
                    CONTINUITY_PRIOR
                } else {
                    0.0
                };
                let score = w_lex * lex + w_llm * llm + w_prior * prior;
                (intent.name.clone(), score.clamp(0.0, 1.0))
            })
            .collect();

        combined.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        combined.truncate(self.max_candidates);
        combined
    }

    async fn llm_scores(
        &self,
        text: &str,
        ctx: &ClassifierContext,
        active: &[Intent],
    ) -> Result<HashMap<IntentName, f64>, turnflow_core::error::LlmError> {
        let key = nlu_cache_key(text, self.config.intent_set_version(), &ctx.recent_intents);
        let template = self.config.template("intent_recognition", None);
        let prompt = render_intent_recognition_prompt(template.as_ref().map(|t| t.body.as_str()), text, active);

        let llm = self.llm.clone();
        let result = self
            .cache
            .get_or_compute("nlu_result", &key, DurationMs::from_millis(30 * 60 * 1000), move || {
                let llm = llm.clone();
                async move {
                    let response = llm
                        .complete(CompletionRequest::deterministic(
                            vec![ChatMessage::system(prompt), ChatMessage::user(text.to_string())],
                            std::time::Duration::from_secs(10),
                        ))
                        .await
                        .map_err(|e| turnflow_core::error::CacheError::BuildFailed(e.to_string()))?;
                    Ok(response.content)
                }
            })
            .await;

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => return Err(turnflow_core::error::LlmError::Transport(e.to_string())),
        };

        parse_llm_candidates(&raw)
    }
}

#[derive(serde::Deserialize)]
struct LlmCandidate {
    intent: String,
    score: f64,
}

#[derive(serde::Deserialize)]
struct LlmCandidatesResponse {
    candidates: Vec<LlmCandidate>,
}

fn parse_llm_candidates(raw: &str) -> Result<HashMap<IntentName, f64>, turnflow_core::error::LlmError> {
    let parsed: LlmCandidatesResponse = serde_json::from_str(raw)
        .map_err(|e| turnflow_core::error::LlmError::SchemaMismatch(e.to_string()))?;
    Ok(parsed
        .candidates
        .into_iter()
        .map(|c| (IntentName::new(c.intent), c.score.clamp(0.0, 1.0)))
        .collect())
}

fn render_intent_recognition_prompt(template: Option<&str>, _text: &str, active: &[Intent]) -> String {
    let catalog: Vec<String> = active.iter().map(|i| i.name.to_string()).collect();
    match template {
        Some(body) => body.replace("${intent_catalog}", &catalog.join(", ")),
        None => format!(
            "Classify the user input into one of these intents: {}. \
             Respond as JSON: {{\"candidates\": [{{\"intent\": str, \"score\": number}}]}}",
            catalog.join(", ")
        ),
    }
}

fn nlu_cache_key(text: &str, intent_set_version: u64, recent_intents: &[IntentName]) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let fingerprint: Vec<&str> = recent_intents.iter().map(|i| i.as_str()).collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(intent_set_version.to_le_bytes());
    hasher.update(fingerprint.join(",").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn lexical_scores(text: &str, active: &[Intent]) -> HashMap<IntentName, f64> {
    let input_tokens = tokenize(text);
    active
        .iter()
        .map(|intent| {
            let best = intent
                .examples
                .iter()
                .map(|example| jaccard(&input_tokens, &tokenize(example)))
                .fold(0.0_f64, f64::max);
            (intent.name.clone(), best)
        })
        .collect()
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace().map(|t| t.to_lowercase()).collect()
}

fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
