//! Claim verification, conflict detection, and deterministic repair.
//!
//! The verifier treats retrieved chunk text strictly as data: it is
//! tokenized and compared, never interpreted. Instruction-like content in
//! a chunk is quoted evidence; instruction-like queries abstain outright.
//!
//! Per-claim verdicts are SUPPORTED / UNSUPPORTED / CONFLICTED; the overall
//! decision is ANSWER, REPAIR (worth one re-synthesis over the same
//! evidence), or ABSTAIN with the list of queries searched. The verifier
//! only ever proposes REPAIR — the orchestrator's budget decides whether
//! it actually runs.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use crate::config::VerifierConfig;
use crate::error::EngineError;
use crate::models::{
    ClaimVerdict, ConflictReport, Decision, DraftAnswer, ScoredChunk, VerificationIssue,
    VerificationResult,
};
use crate::router::{Intent, VerifierMode};
use crate::synthesize::{synthesize, tokenize};

/// `<subject> is/are/was/were/has/have <integer>` over lowercased text.
static NUMBER_FACT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([a-z][a-z0-9\s_-]{2,40})\s+(?:is|are|was|were|has|have)\s+([0-9]{1,4})\b")
        .expect("static pattern")
});

const STOPWORDS: &[&str] = &[
    "what", "when", "where", "which", "with", "that", "this", "from", "into", "your",
];

const PROMPT_INJECTION_TOKENS: &[&str] = &[
    "ignore",
    "bypass",
    "safeguard",
    "safeguards",
    "environment",
    "variables",
    "unrestricted",
    "reveal",
    "password",
    "secret",
    "secrets",
    "exfil",
    "exfiltrate",
    "instructions",
];

const NON_CRITICAL_QUERY_TOKENS: &[&str] = &[
    "mentioned",
    "mention",
    "says",
    "say",
    "describe",
    "explain",
    "summarize",
    "summary",
    "compare",
    "overview",
];

/// Near-miss guard: these query terms must be covered by claims or the
/// answer abstains (e.g. "api endpoint" questions answered off-topic).
const HARD_REQUIRED_QUERY_TOKENS: &[&str] = &[
    "retention",
    "policy",
    "encryption",
    "algorithm",
    "backup",
    "cadence",
    "database",
    "endpoint",
    "api",
];

fn query_tokens(query: &str) -> BTreeSet<String> {
    tokenize(query)
        .into_iter()
        .filter(|token| token.len() >= 4 && !STOPWORDS.contains(&token.as_str()))
        .collect()
}

fn contains_injection_signal(tokens: &BTreeSet<String>) -> bool {
    tokens
        .iter()
        .any(|token| PROMPT_INJECTION_TOKENS.contains(&token.as_str()))
}

/// Exact token hit, or a prefix relationship between long tokens so light
/// inflection ("retention"/"retentions") still counts.
fn token_match(token: &str, text_tokens: &HashSet<String>) -> bool {
    if text_tokens.contains(token) {
        return true;
    }
    if token.len() < 5 {
        return false;
    }
    text_tokens
        .iter()
        .any(|candidate| candidate.len() >= 5 && (candidate.starts_with(token) || token.starts_with(candidate)))
}

/// Token-overlap support score between a claim and one cited chunk.
///
/// Claims whose long or numeric tokens are absent from the chunk score
/// 0.0 outright: a paraphrase that loses the load-bearing term is not
/// support.
pub fn claim_support(claim_text: &str, chunk_text: &str) -> f64 {
    let claim_tokens: Vec<String> = tokenize(claim_text)
        .into_iter()
        .filter(|token| token.len() > 2 && !STOPWORDS.contains(&token.as_str()))
        .collect();
    if claim_tokens.is_empty() {
        return 0.0;
    }

    let chunk_lower = chunk_text.to_lowercase();
    let overlap = claim_tokens
        .iter()
        .filter(|token| chunk_lower.contains(token.as_str()))
        .count();

    let critical: Vec<&String> = claim_tokens
        .iter()
        .filter(|token| token.len() >= 6 || token.chars().all(|c| c.is_ascii_digit()))
        .collect();
    if !critical.is_empty() && critical.iter().any(|token| !chunk_lower.contains(token.as_str())) {
        return 0.0;
    }

    overlap as f64 / claim_tokens.len() as f64
}

/// Extract numeric facts across the evidence set and report any subject
/// asserted with two or more distinct values. Every side keeps its chunk
/// ids — conflicting sources are always cited together.
pub fn detect_conflicts(chunks: &[ScoredChunk]) -> Vec<ConflictReport> {
    let mut facts: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();

    for chunk in chunks {
        let lowered = chunk.chunk_text.to_lowercase();
        for captures in NUMBER_FACT_RE.captures_iter(&lowered) {
            let subject = captures[1].split_whitespace().collect::<Vec<_>>().join(" ");
            let value = captures[2].to_string();
            facts
                .entry(subject)
                .or_default()
                .entry(value)
                .or_default()
                .insert(chunk.chunk_id.clone());
        }
    }

    facts
        .into_iter()
        .filter(|(_, values)| values.len() > 1)
        .map(|(subject, values)| ConflictReport {
            subject,
            values: values
                .into_iter()
                .map(|(value, sources)| (value, sources.into_iter().collect()))
                .collect(),
        })
        .collect()
}

fn critical_coverage_min(cfg: &VerifierConfig, intent: Intent) -> f64 {
    // Facts need stricter entity coverage than synthesis-style intents.
    match intent {
        Intent::Fact => cfg.critical_coverage_min.max(0.5),
        Intent::Lookup => cfg.critical_coverage_min,
        _ => cfg.critical_coverage_min.min(0.2),
    }
}

fn required_alignment_overlap(intent: Intent, query_token_count: usize) -> usize {
    if query_token_count <= 1 {
        return 1;
    }
    match intent {
        Intent::Fact | Intent::Lookup => 2,
        _ => 1,
    }
}

struct ResultBuilder {
    verdicts: Vec<(String, ClaimVerdict)>,
    issues: Vec<VerificationIssue>,
    conflicts: Vec<ConflictReport>,
    decision_path: Vec<String>,
    queries_searched: Vec<String>,
}

impl ResultBuilder {
    fn terminal(
        self,
        decision: Decision,
        verdict_code: &str,
        confidence: f64,
        abstain_reason: Option<&str>,
    ) -> VerificationResult {
        VerificationResult {
            verdicts: self.verdicts,
            decision,
            issues: self.issues,
            conflicts: self.conflicts,
            verdict_code: verdict_code.to_string(),
            confidence,
            decision_path: self.decision_path,
            abstain_reason: abstain_reason.map(|r| r.to_string()),
            queries_searched: self.queries_searched,
        }
    }
}

/// Verify a draft answer against its evidence.
///
/// Returns `EngineError::MalformedClaim` if a citation-less claim reaches
/// this boundary — that is a synthesizer bug, not a verdict.
pub fn verify(
    cfg: &VerifierConfig,
    query: &str,
    draft: &DraftAnswer,
    chunks: &[ScoredChunk],
    mode: VerifierMode,
    intent: Intent,
) -> Result<VerificationResult, EngineError> {
    for claim in &draft.claims {
        if claim.citations.is_empty() {
            return Err(EngineError::MalformedClaim {
                claim_id: claim.claim_id.clone(),
            });
        }
    }

    let mut out = ResultBuilder {
        verdicts: Vec::new(),
        issues: Vec::new(),
        conflicts: Vec::new(),
        decision_path: Vec::new(),
        queries_searched: draft.searched_queries.clone(),
    };
    let q_tokens = query_tokens(query);

    // Jailbreak-like requests are unanswerable from corpus evidence no
    // matter what was retrieved.
    if contains_injection_signal(&q_tokens) {
        out.decision_path.push("prompt_injection_signal".to_string());
        out.issues.push(VerificationIssue {
            kind: "query_mismatch".to_string(),
            claim_id: None,
            detail: "Instruction-like request is unsupported in evidence-only mode.".to_string(),
        });
        return Ok(out.terminal(
            Decision::Abstain,
            "query_mismatch",
            0.0,
            Some("Request is not answerable from trusted corpus evidence."),
        ));
    }

    if mode == VerifierMode::Off {
        out.decision_path.push("mode_off".to_string());
        return Ok(out.terminal(Decision::Answer, "supported", 1.0, None));
    }

    if draft.claims.is_empty() {
        out.decision_path.push("no_claims".to_string());
        out.issues.push(VerificationIssue {
            kind: "insufficient_evidence".to_string(),
            claim_id: None,
            detail: "No claims were available for verification.".to_string(),
        });
        return Ok(out.terminal(
            Decision::Abstain,
            "insufficient_evidence",
            0.0,
            Some("No grounded claims could be extracted from retrieved evidence."),
        ));
    }

    let chunk_by_id: BTreeMap<&str, &ScoredChunk> = chunks
        .iter()
        .map(|chunk| (chunk.chunk_id.as_str(), chunk))
        .collect();

    let conflicts = if matches!(mode, VerifierMode::Strict | VerifierMode::StrictConflict) {
        detect_conflicts(chunks)
    } else {
        Vec::new()
    };

    let mut all_claim_tokens: HashSet<String> = HashSet::new();
    let mut aligned_claims = 0usize;
    let mut supported_claims = 0usize;
    let mut citation_ok_claims = 0usize;

    for claim in &draft.claims {
        let claim_tokens = tokenize(&claim.text);
        all_claim_tokens.extend(claim_tokens.iter().cloned());

        let required = required_alignment_overlap(intent, q_tokens.len());
        let overlap = q_tokens
            .iter()
            .filter(|token| token_match(token, &claim_tokens))
            .count();
        if !q_tokens.is_empty() && overlap >= required {
            aligned_claims += 1;
        }

        // Span quality: the best citation should cover a meaningful share
        // of the claim text.
        let span_quality = claim
            .citations
            .iter()
            .map(|c| c.span_end.saturating_sub(c.span_start))
            .max()
            .unwrap_or(0) as f64
            / claim.text.len().max(1) as f64;
        if span_quality >= cfg.citation_span_quality_min {
            citation_ok_claims += 1;
        } else {
            out.issues.push(VerificationIssue {
                kind: "citation_gap".to_string(),
                claim_id: Some(claim.claim_id.clone()),
                detail: "Citation spans were too weak for this claim.".to_string(),
            });
        }

        let mut best_support = 0.0f64;
        for citation in &claim.citations {
            if let Some(chunk) = chunk_by_id.get(citation.chunk_id.as_str()) {
                best_support = best_support.max(claim_support(&claim.text, &chunk.chunk_text));
                if best_support >= cfg.claim_support_min {
                    break;
                }
            }
        }

        let conflicted = conflicts.iter().any(|conflict| {
            claim.text.to_lowercase().contains(conflict.subject.as_str())
        });

        let verdict = if conflicted {
            ClaimVerdict::Conflicted
        } else if best_support >= cfg.claim_support_min {
            ClaimVerdict::Supported
        } else {
            ClaimVerdict::Unsupported
        };
        if verdict == ClaimVerdict::Supported {
            supported_claims += 1;
        }
        if verdict == ClaimVerdict::Unsupported {
            out.issues.push(VerificationIssue {
                kind: "unsupported_claim".to_string(),
                claim_id: Some(claim.claim_id.clone()),
                detail: format!("{} (support={:.2})", claim.text, best_support),
            });
        }
        out.verdicts.push((claim.claim_id.clone(), verdict));
    }

    let claim_total = draft.claims.len().max(1) as f64;
    let conflicted_claims = out
        .verdicts
        .iter()
        .filter(|(_, v)| *v == ClaimVerdict::Conflicted)
        .count();
    let query_alignment_score = aligned_claims as f64 / claim_total;
    let claim_support_score = (supported_claims + conflicted_claims) as f64 / claim_total;
    let citation_span_quality_score = citation_ok_claims as f64 / claim_total;

    let critical_query_tokens: BTreeSet<&String> = q_tokens
        .iter()
        .filter(|token| {
            (token.len() >= 6 || token.chars().all(|c| c.is_ascii_digit()))
                && !NON_CRITICAL_QUERY_TOKENS.contains(&token.as_str())
        })
        .collect();
    let missing_critical: BTreeSet<&str> = critical_query_tokens
        .iter()
        .filter(|token| !token_match(token, &all_claim_tokens))
        .map(|token| token.as_str())
        .collect();
    let critical_coverage_score = if critical_query_tokens.is_empty() {
        1.0
    } else {
        (critical_query_tokens.len() - missing_critical.len()) as f64
            / critical_query_tokens.len() as f64
    };

    let agreement_score = if conflicts.is_empty() { 1.0 } else { 0.0 };
    out.conflicts = conflicts;

    if !q_tokens.is_empty() && query_alignment_score < cfg.query_alignment_min {
        out.decision_path.push("query_alignment_failed".to_string());
        out.issues.push(VerificationIssue {
            kind: "query_mismatch".to_string(),
            claim_id: None,
            detail: "Retrieved claims are not aligned with the query topic.".to_string(),
        });
        return Ok(out.terminal(
            Decision::Abstain,
            "query_mismatch",
            query_alignment_score,
            Some("Retrieved evidence did not match the query topic."),
        ));
    }

    let missing_hard: Vec<&str> = missing_critical
        .iter()
        .copied()
        .filter(|token| HARD_REQUIRED_QUERY_TOKENS.contains(token))
        .collect();
    if !missing_hard.is_empty() {
        out.decision_path.push("hard_required_token_missing".to_string());
        out.issues.push(VerificationIssue {
            kind: "insufficient_evidence".to_string(),
            claim_id: None,
            detail: format!(
                "Required query term(s) were not supported by retrieved claims: {}",
                missing_hard.join(", ")
            ),
        });
        return Ok(out.terminal(
            Decision::Abstain,
            "insufficient_evidence",
            critical_coverage_score,
            Some("Evidence does not cover required query terms."),
        ));
    }

    if critical_coverage_score < critical_coverage_min(cfg, intent) {
        out.decision_path.push("critical_token_coverage_failed".to_string());
        out.issues.push(VerificationIssue {
            kind: "insufficient_evidence".to_string(),
            claim_id: None,
            detail: "Critical query terms were not supported by retrieved claims.".to_string(),
        });
        return Ok(out.terminal(
            Decision::Abstain,
            "insufficient_evidence",
            critical_coverage_score,
            Some("Evidence does not cover the core entities/terms in the query."),
        ));
    }

    if out.issues.iter().any(|issue| issue.kind == "citation_gap") {
        out.decision_path.push("citation_gap".to_string());
        let confidence = (query_alignment_score + citation_span_quality_score) / 2.0;
        return Ok(out.terminal(
            Decision::Repair,
            "citation_gap",
            confidence,
            Some("Citation coverage/quality was insufficient for one or more claims."),
        ));
    }

    if out
        .verdicts
        .iter()
        .any(|(_, verdict)| *verdict == ClaimVerdict::Unsupported)
    {
        out.decision_path.push("unsupported_claim".to_string());
        return Ok(out.terminal(
            Decision::Repair,
            "unsupported_claim",
            claim_support_score,
            Some("Retrieved evidence did not fully support all claims."),
        ));
    }

    let aggregate = query_alignment_score * 0.35
        + claim_support_score * 0.35
        + citation_span_quality_score * 0.20
        + agreement_score * 0.10;
    if aggregate < cfg.aggregate_min {
        out.decision_path.push("aggregate_below_threshold".to_string());
        return Ok(out.terminal(
            Decision::Abstain,
            "insufficient_evidence",
            aggregate,
            Some("Combined evidence confidence is below threshold."),
        ));
    }

    out.decision_path.push("supported".to_string());
    Ok(out.terminal(Decision::Answer, "supported", aggregate, None))
}

/// Attempt a single deterministic repair by re-synthesizing from the
/// already-retrieved evidence. No new retrieval happens here; claims are
/// replaced wholesale, never mutated in place.
pub fn repair(
    cfg: &VerifierConfig,
    query: &str,
    draft: &DraftAnswer,
    chunks: &[ScoredChunk],
    mode: VerifierMode,
    intent: Intent,
) -> Result<Option<DraftAnswer>, EngineError> {
    let verification = verify(cfg, query, draft, chunks, mode, intent)?;
    match verification.decision {
        Decision::Answer => return Ok(Some(draft.clone())),
        // Repair cannot add evidence; these verdicts need retrieval, not
        // re-synthesis.
        Decision::Abstain => return Ok(None),
        Decision::Repair => {}
    }

    let mut repaired = synthesize(query, chunks, intent)?;
    repaired.searched_queries = draft.searched_queries.clone();

    let reverified = verify(cfg, query, &repaired, chunks, mode, intent)?;
    if reverified.decision == Decision::Answer {
        Ok(Some(repaired))
    } else {
        Ok(None)
    }
}
