//! Deterministic follow-up query proposal for the bounded expansion hop.
//!
//! When verification leaves claims unsupported, the orchestrator may run
//! exactly one extra retrieval pass. The follow-up query is derived from
//! the unsupported claims' own vocabulary — tokens the original query did
//! not contain — so the hop is reproducible and needs no model call.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::DraftAnswer;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("static pattern"));

const MAX_ADDITIONS: usize = 6;

fn ordered_tokens(text: &str) -> Vec<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Build a single deterministic follow-up query from missing-evidence
/// signals. Returns `None` when there is nothing new to add — the
/// orchestrator then skips the hop entirely.
pub fn propose_followup(
    query: &str,
    draft: Option<&DraftAnswer>,
    missing_claims: &[String],
) -> Option<String> {
    let mut seed_text = missing_claims.join(" ");
    if seed_text.trim().is_empty() {
        if let Some(draft) = draft {
            seed_text = draft
                .claims
                .iter()
                .take(2)
                .map(|claim| claim.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
        }
    }
    if seed_text.trim().is_empty() {
        return None;
    }

    let original: Vec<String> = ordered_tokens(query);
    let mut additions: Vec<String> = Vec::new();
    for token in ordered_tokens(&seed_text) {
        if token.len() < 4 {
            continue;
        }
        if original.contains(&token) || additions.contains(&token) {
            continue;
        }
        additions.push(token);
        if additions.len() >= MAX_ADDITIONS {
            break;
        }
    }

    if additions.is_empty() {
        return None;
    }
    Some(format!("{} {}", query, additions.join(" ")))
}
