//! Policy-driven query router.
//!
//! Maps a raw query to an intent label and the pipeline configuration that
//! intent should run with. The routing logic is a generic matcher over
//! [`RouterPolicy`] data — phrase tables and per-intent settings live in
//! configuration (with a complete built-in default), not in code branches.
//!
//! [`route`] is a pure function: identical `(query, policy)` inputs always
//! produce identical output. Reproducible evaluation depends on this.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of query intents the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Lookup,
    Fact,
    Synthesis,
    Compare,
    Timeline,
    Task,
    Other,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Lookup => "lookup",
            Intent::Fact => "fact",
            Intent::Synthesis => "synthesis",
            Intent::Compare => "compare",
            Intent::Timeline => "timeline",
            Intent::Task => "task",
            Intent::Other => "other",
        }
    }
}

/// How strictly the verifier gates an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierMode {
    Off,
    Minimal,
    Strict,
    StrictConflict,
}

/// Per-intent pipeline parameterization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub top_k: usize,
    pub run_vector: bool,
    /// Multiplier on the lexical channel's RRF contribution; the vector
    /// contribution weight is fixed at 1.0.
    pub lexical_weight: f64,
    pub run_rerank: bool,
    pub allow_multihop: bool,
    pub generate_answer: bool,
    pub verifier_mode: VerifierMode,
    pub max_repairs: u32,
}

/// One routing rule. A rule matches when ANY of its configured predicates
/// holds; the first matching rule in policy order wins.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub intent: Intent,
    /// Short label recorded in the run trace when this rule fires.
    pub signal: String,
    /// Match if the normalized query contains any of these phrases.
    #[serde(default)]
    pub any_phrases: Vec<String>,
    /// Match if the query carries a double-quoted fragment.
    #[serde(default)]
    pub if_quoted: bool,
    /// Match if the query ends with a question mark.
    #[serde(default)]
    pub if_question: bool,
    /// Match if the query has at most this many words.
    #[serde(default)]
    pub max_words: Option<usize>,
}

impl RouteRule {
    fn matches(&self, normalized: &str) -> bool {
        if self.if_quoted && normalized.contains('"') {
            return true;
        }
        if self.if_question && normalized.ends_with('?') {
            return true;
        }
        if let Some(max) = self.max_words {
            if normalized.split_whitespace().count() <= max {
                return true;
            }
        }
        self.any_phrases
            .iter()
            .any(|phrase| normalized.contains(phrase.as_str()))
    }
}

/// Externally supplied routing policy: ordered rules, per-intent pipeline
/// settings, and a fallback intent for unmatched queries.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterPolicy {
    #[serde(default = "default_rules")]
    pub rules: Vec<RouteRule>,
    #[serde(default = "default_intent_configs")]
    pub intents: BTreeMap<Intent, PipelineConfig>,
    #[serde(default = "default_fallback_intent")]
    pub fallback_intent: Intent,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            intents: default_intent_configs(),
            fallback_intent: default_fallback_intent(),
        }
    }
}

impl RouterPolicy {
    pub fn config_for(&self, intent: Intent) -> Option<&PipelineConfig> {
        self.intents.get(&intent)
    }

    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            let has_predicate = !rule.any_phrases.is_empty()
                || rule.if_quoted
                || rule.if_question
                || rule.max_words.is_some();
            if !has_predicate {
                anyhow::bail!("router rule '{}' has no predicate", rule.signal);
            }
            if self.config_for(rule.intent).is_none() {
                anyhow::bail!(
                    "router rule '{}' targets intent '{}' with no pipeline config",
                    rule.signal,
                    rule.intent.as_str()
                );
            }
        }
        if self.config_for(self.fallback_intent).is_none() {
            anyhow::bail!(
                "fallback intent '{}' has no pipeline config",
                self.fallback_intent.as_str()
            );
        }
        for (intent, config) in &self.intents {
            if config.top_k == 0 {
                anyhow::bail!("intent '{}' has top_k = 0", intent.as_str());
            }
            if config.lexical_weight < 0.0 {
                anyhow::bail!("intent '{}' has negative lexical_weight", intent.as_str());
            }
        }
        Ok(())
    }
}

/// Routing outcome: the matched intent, its pipeline config, and the
/// signals that fired (for the run trace).
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub intent: Intent,
    pub config: PipelineConfig,
    pub signals: Vec<String>,
}

/// Classify a query against a policy. Pure and deterministic; unmatched
/// queries fall back to the policy's default intent, never an error.
pub fn route(query: &str, policy: &RouterPolicy) -> RouteDecision {
    let normalized = query.trim().to_lowercase();

    let mut intent = policy.fallback_intent;
    let mut signals = Vec::new();

    if !normalized.is_empty() {
        for rule in &policy.rules {
            if rule.matches(&normalized) {
                intent = rule.intent;
                signals.push(rule.signal.clone());
                break;
            }
        }
    }

    let config = policy
        .config_for(intent)
        .or_else(|| policy.config_for(policy.fallback_intent))
        .cloned()
        .unwrap_or_else(fallback_config);

    RouteDecision {
        intent,
        config,
        signals,
    }
}

fn fallback_config() -> PipelineConfig {
    PipelineConfig {
        top_k: 12,
        run_vector: true,
        lexical_weight: 1.0,
        run_rerank: false,
        allow_multihop: false,
        generate_answer: true,
        verifier_mode: VerifierMode::Strict,
        max_repairs: 1,
    }
}

fn default_fallback_intent() -> Intent {
    Intent::Other
}

fn default_rules() -> Vec<RouteRule> {
    let phrase_rule = |intent: Intent, signal: &str, phrases: &[&str]| RouteRule {
        intent,
        signal: signal.to_string(),
        any_phrases: phrases.iter().map(|p| p.to_string()).collect(),
        if_quoted: false,
        if_question: false,
        max_words: None,
    };

    vec![
        RouteRule {
            intent: Intent::Lookup,
            signal: "explicit_lookup".to_string(),
            any_phrases: vec![
                "exact".to_string(),
                "verbatim".to_string(),
                "quote".to_string(),
            ],
            if_quoted: true,
            if_question: false,
            max_words: None,
        },
        phrase_rule(
            Intent::Compare,
            "compare_phrase",
            &["compare", "difference", "diff", " vs ", "versus"],
        ),
        phrase_rule(
            Intent::Timeline,
            "timeline_phrase",
            &["timeline", "chronology", "milestones", "dates"],
        ),
        phrase_rule(
            Intent::Task,
            "task_phrase",
            &[
                "how to", "steps", "procedure", "guide", "how do i", "checklist", "plan", "todo",
                "tasks",
            ],
        ),
        phrase_rule(
            Intent::Synthesis,
            "synthesis_phrase",
            &[
                "summary",
                "summarize",
                "overview",
                "combine",
                "synthesize",
                "across sources",
                "overall",
                "merge",
            ],
        ),
        RouteRule {
            intent: Intent::Fact,
            signal: "fact_phrase".to_string(),
            any_phrases: vec![
                "what is".to_string(),
                "define".to_string(),
                "definition".to_string(),
                "who".to_string(),
                "when".to_string(),
                "where".to_string(),
                "which".to_string(),
                "what".to_string(),
                "how many".to_string(),
            ],
            if_quoted: false,
            if_question: true,
            max_words: None,
        },
        RouteRule {
            intent: Intent::Lookup,
            signal: "short_query".to_string(),
            any_phrases: Vec::new(),
            if_quoted: false,
            if_question: false,
            max_words: Some(4),
        },
    ]
}

fn default_intent_configs() -> BTreeMap<Intent, PipelineConfig> {
    BTreeMap::from([
        (
            Intent::Lookup,
            PipelineConfig {
                top_k: 8,
                run_vector: false,
                lexical_weight: 4.0,
                run_rerank: false,
                allow_multihop: false,
                generate_answer: false,
                verifier_mode: VerifierMode::Minimal,
                max_repairs: 0,
            },
        ),
        (
            Intent::Fact,
            PipelineConfig {
                top_k: 10,
                run_vector: true,
                lexical_weight: 1.0,
                run_rerank: false,
                allow_multihop: false,
                generate_answer: true,
                verifier_mode: VerifierMode::Strict,
                max_repairs: 1,
            },
        ),
        (
            Intent::Synthesis,
            PipelineConfig {
                top_k: 24,
                run_vector: true,
                lexical_weight: 0.65,
                run_rerank: true,
                allow_multihop: true,
                generate_answer: true,
                verifier_mode: VerifierMode::StrictConflict,
                max_repairs: 1,
            },
        ),
        (
            Intent::Compare,
            PipelineConfig {
                top_k: 20,
                run_vector: true,
                lexical_weight: 1.0,
                run_rerank: true,
                allow_multihop: true,
                generate_answer: true,
                verifier_mode: VerifierMode::Strict,
                max_repairs: 1,
            },
        ),
        (
            Intent::Timeline,
            PipelineConfig {
                top_k: 20,
                run_vector: true,
                lexical_weight: 1.5,
                run_rerank: true,
                allow_multihop: true,
                generate_answer: true,
                verifier_mode: VerifierMode::StrictConflict,
                max_repairs: 1,
            },
        ),
        (
            Intent::Task,
            PipelineConfig {
                top_k: 20,
                run_vector: true,
                lexical_weight: 0.65,
                run_rerank: true,
                allow_multihop: true,
                generate_answer: true,
                verifier_mode: VerifierMode::Strict,
                max_repairs: 1,
            },
        ),
        (Intent::Other, fallback_config()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_is_deterministic() {
        let policy = RouterPolicy::default();
        let first = route("compare retention policy with backup cadence", &policy);
        let second = route("compare retention policy with backup cadence", &policy);
        assert_eq!(first.intent, second.intent);
        assert_eq!(first.config, second.config);
        assert_eq!(first.signals, second.signals);
    }

    #[test]
    fn test_phrase_rules_map_to_intents() {
        let policy = RouterPolicy::default();
        assert_eq!(route("compare alpha versus beta storage", &policy).intent, Intent::Compare);
        assert_eq!(
            route("show the project timeline and key milestones please", &policy).intent,
            Intent::Timeline
        );
        assert_eq!(
            route("how do i rotate the signing keys safely", &policy).intent,
            Intent::Task
        );
        assert_eq!(
            route("summarize the incident reports across sources", &policy).intent,
            Intent::Synthesis
        );
        assert_eq!(
            route("what is the database backup cadence", &policy).intent,
            Intent::Fact
        );
    }

    #[test]
    fn test_quoted_query_routes_to_lookup() {
        let policy = RouterPolicy::default();
        let decision = route("find \"exact phrase in the handbook\" for me please", &policy);
        assert_eq!(decision.intent, Intent::Lookup);
        assert_eq!(decision.signals, vec!["explicit_lookup".to_string()]);
    }

    #[test]
    fn test_short_query_routes_to_lookup() {
        let policy = RouterPolicy::default();
        assert_eq!(route("rotation schedule", &policy).intent, Intent::Lookup);
    }

    #[test]
    fn test_unmatched_query_falls_back() {
        let policy = RouterPolicy::default();
        let decision = route(
            "an unusually long rambling statement mentioning nothing the rules know about at all here",
            &policy,
        );
        assert_eq!(decision.intent, Intent::Other);
        assert!(decision.signals.is_empty());
    }

    #[test]
    fn test_empty_query_falls_back_without_signals() {
        let policy = RouterPolicy::default();
        let decision = route("   ", &policy);
        assert_eq!(decision.intent, Intent::Other);
        assert!(decision.signals.is_empty());
    }

    #[test]
    fn test_default_policy_validates() {
        RouterPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_rule_without_predicate_rejected() {
        let mut policy = RouterPolicy::default();
        policy.rules.push(RouteRule {
            intent: Intent::Fact,
            signal: "empty_rule".to_string(),
            any_phrases: Vec::new(),
            if_quoted: false,
            if_question: false,
            max_words: None,
        });
        assert!(policy.validate().is_err());
    }
}
