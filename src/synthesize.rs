//! Deterministic extractive answer synthesis with claim-level citations.
//!
//! Claims are sentences lifted verbatim from retrieved chunks, scored by
//! query overlap and source relevance. Every claim carries at least one
//! character-span citation into the chunk it came from; when several
//! retrieved chunks contain the same sentence, all of them are cited.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::error::EngineError;
use crate::models::{Citation, Claim, DraftAnswer, ScoredChunk};
use crate::router::Intent;

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("static pattern"));

/// Minimum sentence length considered claim-worthy.
const MIN_SENTENCE_CHARS: usize = 24;

pub fn tokenize(text: &str) -> HashSet<String> {
    TOKEN_RE
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Split chunk text into candidate sentences on `.` `!` `?` and newlines.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            if chars.peek().map_or(true, |next| next.is_whitespace()) {
                push_sentence(&mut sentences, &mut current);
            }
        }
    }
    push_sentence(&mut sentences, &mut current);

    sentences
        .into_iter()
        .filter(|s| s.len() >= MIN_SENTENCE_CHARS)
        .collect()
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

fn claim_limit(intent: Intent) -> usize {
    match intent {
        Intent::Synthesis | Intent::Compare | Intent::Timeline => 5,
        Intent::Task => 4,
        _ => 3,
    }
}

/// Locate the sentence inside a chunk and build its span citation.
/// Falls back to the chunk's opening span when the exact text moved
/// (e.g. whitespace normalization between chunking and synthesis).
fn citation_for_sentence(sentence: &str, chunk: &ScoredChunk) -> Citation {
    let haystack = chunk.chunk_text.to_lowercase();
    let needle = sentence.to_lowercase();
    match haystack.find(&needle) {
        Some(start) => Citation {
            chunk_id: chunk.chunk_id.clone(),
            source_path: chunk.source_path.clone(),
            page: chunk.page,
            span_start: start,
            span_end: (start + needle.len()).min(chunk.chunk_text.len()),
        },
        None => Citation {
            chunk_id: chunk.chunk_id.clone(),
            source_path: chunk.source_path.clone(),
            page: chunk.page,
            span_start: 0,
            span_end: chunk.chunk_text.len().min(sentence.len().max(80)),
        },
    }
}

/// Create a deterministic extractive draft from retrieved evidence.
///
/// Returns a draft with zero claims when the evidence has no usable
/// sentences at all; the verifier turns that into an abstain.
pub fn synthesize(
    query: &str,
    chunks: &[ScoredChunk],
    intent: Intent,
) -> Result<DraftAnswer, EngineError> {
    let query_tokens = tokenize(query);
    let content_tokens: HashSet<&String> =
        query_tokens.iter().filter(|token| token.len() >= 4).collect();

    let mut candidates: Vec<(f64, usize, String, &ScoredChunk)> = Vec::new();
    for chunk in chunks {
        for sentence in split_sentences(&chunk.chunk_text) {
            let sentence_tokens = tokenize(&sentence);
            let overlap = sentence_tokens.intersection(&query_tokens).count();
            let content_overlap = sentence_tokens
                .iter()
                .filter(|token| content_tokens.contains(token))
                .count();
            let length_bonus = (sentence.len() as f64 / 200.0).min(1.0);
            let score = overlap as f64 * 2.0 + chunk.score + length_bonus;
            candidates.push((score, content_overlap, sentence, chunk));
        }
    }

    // Off-topic sentences only become claims when nothing on-topic exists
    // at all; otherwise they dilute verification for no gain.
    if candidates.iter().any(|(_, content_overlap, _, _)| *content_overlap > 0) {
        candidates.retain(|(_, content_overlap, _, _)| *content_overlap > 0);
    }
    // Stable sort: ties keep fused evidence order, so output is
    // reproducible for a fixed evidence list.
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut claims: Vec<Claim> = Vec::new();
    let mut seen_sentences: HashSet<String> = HashSet::new();
    let cap = claim_limit(intent);

    for (_, _, sentence, chunk) in &candidates {
        let normalized = sentence.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        if !seen_sentences.insert(normalized) {
            continue;
        }

        let claim_id = format!("c{}", claims.len() + 1);
        let mut citations = vec![citation_for_sentence(sentence, chunk)];

        // Corroborating chunks that carry the same sentence get cited too.
        let needle = sentence.to_lowercase();
        for other in chunks {
            if other.chunk_id != chunk.chunk_id
                && other.chunk_text.to_lowercase().contains(&needle)
            {
                citations.push(citation_for_sentence(sentence, other));
            }
        }

        claims.push(Claim::new(claim_id, sentence.clone(), citations)?);
        if claims.len() >= cap {
            break;
        }
    }

    // Last resort: cite the opening of the best chunk.
    if claims.is_empty() {
        if let Some(first) = chunks.first() {
            let mut end = first.chunk_text.len().min(200);
            while end < first.chunk_text.len() && !first.chunk_text.is_char_boundary(end) {
                end += 1;
            }
            let fallback = first.chunk_text[..end].trim().to_string();
            if !fallback.is_empty() {
                let citation = citation_for_sentence(&fallback, first);
                claims.push(Claim::new("c1", fallback, vec![citation])?);
            }
        }
    }

    Ok(DraftAnswer {
        claims,
        searched_queries: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(chunk_id: &str, text: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: chunk_id.to_string(),
            doc_id: "doc1".to_string(),
            score,
            chunk_text: text.to_string(),
            source_path: "notes.md".to_string(),
            page: None,
        }
    }

    #[test]
    fn test_split_sentences_filters_short_fragments() {
        let sentences = split_sentences(
            "Short. The database backup cadence is nightly at two. Ok? \
             Retention is ninety days for all archived snapshots.",
        );
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("backup cadence"));
    }

    #[test]
    fn test_every_claim_has_a_citation() {
        let chunks = vec![
            chunk("ch_a", "The database backup cadence is nightly at two.", 0.9),
            chunk("ch_b", "Retention is ninety days for all archived snapshots.", 0.7),
        ];
        let draft = synthesize("what is the backup cadence", &chunks, Intent::Fact).unwrap();
        assert!(!draft.claims.is_empty());
        for claim in &draft.claims {
            assert!(!claim.citations.is_empty());
        }
    }

    #[test]
    fn test_query_overlap_ranks_claims() {
        let chunks = vec![
            chunk("ch_a", "Nothing relevant lives inside this particular sentence.", 0.5),
            chunk("ch_b", "The database backup cadence is nightly at two.", 0.5),
        ];
        let draft = synthesize("database backup cadence", &chunks, Intent::Fact).unwrap();
        assert!(draft.claims[0].text.contains("backup cadence"));
    }

    #[test]
    fn test_claim_cap_by_intent() {
        let text: String = (0..12)
            .map(|i| format!("Fact number {} concerning the retention policy here. ", i))
            .collect();
        let chunks = vec![chunk("ch_a", &text, 0.5)];

        let fact = synthesize("retention", &chunks, Intent::Fact).unwrap();
        assert!(fact.claims.len() <= 3);

        let synthesis = synthesize("retention", &chunks, Intent::Synthesis).unwrap();
        assert!(synthesis.claims.len() <= 5);
        assert!(synthesis.claims.len() > fact.claims.len());
    }

    #[test]
    fn test_duplicate_sentences_collapse_into_corroborating_citations() {
        let sentence = "The retention period is ninety days for snapshots.";
        let chunks = vec![chunk("ch_a", sentence, 0.9), chunk("ch_b", sentence, 0.8)];
        let draft = synthesize("retention period", &chunks, Intent::Fact).unwrap();
        assert_eq!(draft.claims.len(), 1);
        let cited: Vec<&str> = draft.claims[0]
            .citations
            .iter()
            .map(|c| c.chunk_id.as_str())
            .collect();
        assert!(cited.contains(&"ch_a"));
        assert!(cited.contains(&"ch_b"));
    }

    #[test]
    fn test_citation_span_points_into_chunk() {
        let chunks = vec![chunk(
            "ch_a",
            "Preamble text first. The database backup cadence is nightly at two.",
            0.9,
        )];
        let draft = synthesize("backup cadence", &chunks, Intent::Fact).unwrap();
        let citation = &draft.claims[0].citations[0];
        assert!(citation.span_start > 0);
        assert!(citation.span_end <= chunks[0].chunk_text.len());
        assert!(citation.span_end > citation.span_start);
    }

    #[test]
    fn test_off_topic_sentences_dropped_when_on_topic_exists() {
        let chunks = vec![
            chunk("ch_a", "The database backup cadence is nightly at two.", 0.9),
            chunk("ch_b", "Unrelated prose about cafeteria seating arrangements.", 0.8),
        ];
        let draft = synthesize("database backup cadence", &chunks, Intent::Synthesis).unwrap();
        assert!(draft
            .claims
            .iter()
            .all(|claim| claim.text.contains("backup")));
    }

    #[test]
    fn test_empty_evidence_yields_no_claims() {
        let draft = synthesize("anything", &[], Intent::Fact).unwrap();
        assert!(draft.claims.is_empty());
    }
}
