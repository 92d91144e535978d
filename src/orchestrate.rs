//! Query orchestration: the state machine behind search and answer modes.
//!
//! One run walks `Route → Retrieve` and, in answer mode, continues through
//! `Synthesize → Verify` with at most one evidence-expansion hop and at
//! most one repair pass. The hop and repair bounds are enforced here by
//! [`LoopBudget`] counters, not by the verifier's judgment — even a
//! verifier that keeps requesting repair cannot loop the pipeline.
//!
//! Nothing is persisted until a run reaches a terminal state; an aborted
//! future leaves no partial claims behind. The finished trace and run row
//! are written exactly once.

use anyhow::Result;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::error::EngineError;
use crate::hop::propose_followup;
use crate::models::{
    ClaimVerdict, Decision, DraftAnswer, RankedChunks, ScoredChunk, VerificationResult,
};
use crate::retrieval::{fuse_hybrid, rerank_overlap, search_lexical, search_vector, SearchFilters};
use crate::router::{route, Intent, PipelineConfig};
use crate::synthesize::synthesize;
use crate::trace::{log_run, ToolTrace};
use crate::verify::{repair, verify};

/// Execution mode for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Search,
    Answer,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Search => "search",
            Mode::Answer => "answer",
        }
    }
}

/// Strictly-decrementing loop budgets. Exhausting a budget and asking
/// again is an internal fault, not a judgment call.
#[derive(Debug)]
struct LoopBudget {
    hops: u32,
    repairs: u32,
}

impl LoopBudget {
    fn new(config: &PipelineConfig) -> Self {
        Self {
            hops: if config.allow_multihop { 1 } else { 0 },
            repairs: config.max_repairs.min(1),
        }
    }

    fn take_hop(&mut self) -> Result<(), EngineError> {
        if self.hops == 0 {
            return Err(EngineError::LoopBudgetExceeded {
                stage: "expand".to_string(),
            });
        }
        self.hops -= 1;
        Ok(())
    }

    fn take_repair(&mut self) -> Result<(), EngineError> {
        if self.repairs == 0 {
            return Err(EngineError::LoopBudgetExceeded {
                stage: "repair".to_string(),
            });
        }
        self.repairs -= 1;
        Ok(())
    }
}

/// Caller-level knobs for one run: CLI overrides on top of the routed
/// pipeline config, plus metadata filters for both retrieval channels.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub run_vector: Option<bool>,
    pub filters: SearchFilters,
}

/// Explicit answer-mode states; transitions are recorded in the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerStage {
    Synthesize,
    Verify,
    MaybeExpand,
    MaybeRepair,
    Finalize,
}

/// Terminal result of one run.
#[derive(Debug)]
pub struct OrchestrationResult {
    pub run_id: String,
    pub mode: Mode,
    pub intent: Intent,
    pub chunks: Vec<ScoredChunk>,
    pub answer: Option<DraftAnswer>,
    pub verification: Option<VerificationResult>,
    pub latency_ms: f64,
}

impl OrchestrationResult {
    /// Answer-mode runs terminate in exactly one of cited-answer or
    /// abstain-with-rationale; search-mode runs are a ranked list.
    pub fn to_output_json(&self) -> serde_json::Value {
        match self.mode {
            Mode::Search => json!({
                "results": self.chunks.iter().map(|chunk| {
                    json!({
                        "chunk_id": chunk.chunk_id,
                        "score": chunk.score,
                        "source_path": chunk.source_path,
                        "page": chunk.page,
                        "snippet": snippet_of(&chunk.chunk_text),
                    })
                }).collect::<Vec<_>>(),
            }),
            Mode::Answer => {
                let verification = self.verification.as_ref();
                let answered = verification
                    .map(|v| v.decision == Decision::Answer)
                    .unwrap_or(false);

                if !answered {
                    let reason = verification
                        .and_then(|v| v.abstain_reason.clone())
                        .unwrap_or_else(|| "No supported answer could be produced.".to_string());
                    let queries = verification
                        .map(|v| v.queries_searched.clone())
                        .unwrap_or_default();
                    return json!({
                        "abstain": true,
                        "reason": reason,
                        "queries_searched": queries,
                    });
                }

                let verification = verification.expect("answered implies verification");
                let claims: Vec<serde_json::Value> = self
                    .answer
                    .as_ref()
                    .map(|draft| {
                        draft
                            .claims
                            .iter()
                            .map(|claim| {
                                json!({
                                    "text": claim.text,
                                    "verdict": verification.verdict_for(&claim.claim_id),
                                    "citations": claim.citations.iter().map(|c| {
                                        json!({
                                            "chunk_id": c.chunk_id,
                                            "source_path": c.source_path,
                                            "page": c.page,
                                            "span": [c.span_start, c.span_end],
                                        })
                                    }).collect::<Vec<_>>(),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                json!({
                    "claims": claims,
                    "conflicts": verification.conflicts.iter().map(|c| {
                        json!({
                            "subject": c.subject,
                            "values": c.values,
                            "detail": c.describe(),
                        })
                    }).collect::<Vec<_>>(),
                    "confidence": verification.confidence,
                })
            }
        }
    }
}

fn snippet_of(text: &str) -> String {
    let mut end = text.len().min(240);
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    text[..end].replace('\n', " ").trim().to_string()
}

/// Run one retrieval pass: lexical, optionally vector behind the manifest
/// gate, then fusion. A stale vector index degrades to lexical-only when
/// policy allows, and the degradation is visible in the trace.
async fn run_retrieval(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    top_k: usize,
    run_vector: bool,
    lexical_weight: f64,
    filters: &SearchFilters,
    trace: &mut ToolTrace,
) -> Result<RankedChunks> {
    let candidate_k = config.retrieval.candidate_k.max(top_k as i64);
    let lexical = search_lexical(pool, query, filters, candidate_k).await?;

    let mut vector: Option<RankedChunks> = None;
    let mut degraded_reason: Option<String> = None;

    if run_vector {
        match search_vector(pool, config, query, filters, candidate_k).await {
            Ok(ranked) => vector = Some(ranked),
            Err(err) => match err.downcast_ref::<EngineError>() {
                Some(EngineError::StaleIndex { reason })
                    if config.retrieval.lexical_fallback_on_stale =>
                {
                    debug!(%reason, "vector search refused; degrading to lexical-only");
                    degraded_reason = Some(reason.clone());
                }
                _ => return Err(err),
            },
        }
    }

    let fused = match &vector {
        Some(vector) => fuse_hybrid(
            &lexical,
            vector,
            top_k,
            config.retrieval.rrf_k,
            lexical_weight,
        ),
        None => {
            let mut lexical_only = lexical.clone();
            lexical_only.chunks.truncate(top_k);
            lexical_only
        }
    };

    trace.record(
        "retrieve",
        json!({
            "query": query,
            "lexical_hits": lexical.chunks.len(),
            "vector_hits": vector.as_ref().map(|v| v.chunks.len()),
            "vector_degraded": degraded_reason,
            "fused_hits": fused.chunks.len(),
        }),
        lexical.latency_ms
            + vector.as_ref().map(|v| v.latency_ms).unwrap_or(0.0)
            + fused.latency_ms,
    );

    Ok(fused)
}

/// Merge expansion results into the evidence set, deduplicating by
/// `chunk_id` and keeping the higher score.
fn merge_chunks(primary: &[ScoredChunk], secondary: &[ScoredChunk]) -> Vec<ScoredChunk> {
    let mut by_id: HashMap<String, ScoredChunk> = HashMap::new();
    for chunk in primary.iter().chain(secondary.iter()) {
        match by_id.get(&chunk.chunk_id) {
            Some(existing) if existing.score >= chunk.score => {}
            _ => {
                by_id.insert(chunk.chunk_id.clone(), chunk.clone());
            }
        }
    }
    let mut merged: Vec<ScoredChunk> = by_id.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    merged
}

fn unsupported_claim_texts(
    draft: &DraftAnswer,
    verification: &VerificationResult,
) -> Vec<String> {
    draft
        .claims
        .iter()
        .filter(|claim| {
            verification.verdict_for(&claim.claim_id) == Some(ClaimVerdict::Unsupported)
        })
        .map(|claim| claim.text.clone())
        .collect()
}

/// Execute one query end-to-end and persist its run record.
pub async fn run_query(
    config: &Config,
    query: &str,
    mode: Mode,
    options: QueryOptions,
) -> Result<OrchestrationResult> {
    let start = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    let mut trace = ToolTrace::new();

    // ROUTE
    let decision = route(query, &config.router);
    let pipeline = decision.config.clone();
    let intent = decision.intent;
    let top_k = options.top_k.unwrap_or(pipeline.top_k);
    let run_vector = options.run_vector.unwrap_or(pipeline.run_vector);
    trace.record(
        "route",
        json!({
            "intent": intent.as_str(),
            "signals": decision.signals,
            "top_k": top_k,
            "run_vector": run_vector,
            "lexical_weight": pipeline.lexical_weight,
            "run_rerank": pipeline.run_rerank,
            "allow_multihop": pipeline.allow_multihop,
            "verifier_mode": pipeline.verifier_mode,
        }),
        0.0,
    );

    let pool = db::connect(config).await?;
    let mut searched_queries = vec![query.to_string()];

    // RETRIEVE
    let fused = run_retrieval(
        &pool,
        config,
        query,
        top_k,
        run_vector,
        pipeline.lexical_weight,
        &options.filters,
        &mut trace,
    )
    .await?;
    let mut chunks = fused.chunks;
    if pipeline.run_rerank {
        chunks = rerank_overlap(query, &chunks, config.retrieval.rerank_top_n);
    }

    if mode == Mode::Search {
        trace.record("search_done", json!({"results": chunks.len()}), 0.0);
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        log_run(&pool, &run_id, query, intent.as_str(), &trace, latency_ms).await?;
        pool.close().await;
        return Ok(OrchestrationResult {
            run_id,
            mode,
            intent,
            chunks,
            answer: None,
            verification: None,
            latency_ms,
        });
    }

    // ANSWER: bounded synthesize/verify loop.
    let mut budget = LoopBudget::new(&pipeline);
    let mut stage = AnswerStage::Synthesize;
    let mut draft: Option<DraftAnswer> = None;
    let mut verification: Option<VerificationResult> = None;
    let mut expanded = false;

    // Zero evidence short-circuits straight to abstain.
    if chunks.is_empty() {
        trace.record("empty_evidence", json!({"queries": searched_queries}), 0.0);
        verification = Some(VerificationResult {
            verdicts: Vec::new(),
            decision: Decision::Abstain,
            issues: Vec::new(),
            conflicts: Vec::new(),
            verdict_code: "empty_evidence".to_string(),
            confidence: 0.0,
            decision_path: vec!["empty_evidence".to_string()],
            abstain_reason: Some("No evidence was retrieved for this query.".to_string()),
            queries_searched: searched_queries.clone(),
        });
        stage = AnswerStage::Finalize;
    }

    while stage != AnswerStage::Finalize {
        match stage {
            AnswerStage::Synthesize => {
                let stage_start = Instant::now();
                let mut synthesized = synthesize(query, &chunks, intent)?;
                synthesized.searched_queries = searched_queries.clone();
                trace.record(
                    "synthesize",
                    json!({"claims": synthesized.claims.len()}),
                    stage_start.elapsed().as_secs_f64() * 1000.0,
                );
                draft = Some(synthesized);
                stage = AnswerStage::Verify;
            }
            AnswerStage::Verify => {
                let stage_start = Instant::now();
                let current = draft.as_ref().expect("verify follows synthesize");
                let result = verify(
                    &config.verifier,
                    query,
                    current,
                    &chunks,
                    pipeline.verifier_mode,
                    intent,
                )?;
                trace.record(
                    "verify",
                    json!({
                        "decision": result.decision,
                        "verdict_code": result.verdict_code,
                        "confidence": result.confidence,
                        "conflicts": result.conflicts.len(),
                        "decision_path": result.decision_path,
                    }),
                    stage_start.elapsed().as_secs_f64() * 1000.0,
                );
                verification = Some(result);
                stage = if expanded {
                    AnswerStage::MaybeRepair
                } else {
                    AnswerStage::MaybeExpand
                };
            }
            AnswerStage::MaybeExpand => {
                let result = verification.as_ref().expect("expand follows verify");
                if result.decision == Decision::Answer || budget.hops == 0 {
                    stage = AnswerStage::MaybeRepair;
                    continue;
                }

                let missing =
                    unsupported_claim_texts(draft.as_ref().expect("draft exists"), result);
                let followup = propose_followup(query, draft.as_ref(), &missing)
                    .filter(|followup| !searched_queries.contains(followup));

                match followup {
                    Some(followup) => {
                        budget.take_hop()?;
                        let stage_start = Instant::now();
                        searched_queries.push(followup.clone());
                        let hop_fused = run_retrieval(
                            &pool,
                            config,
                            &followup,
                            top_k,
                            run_vector,
                            pipeline.lexical_weight,
                            &options.filters,
                            &mut trace,
                        )
                        .await?;
                        let before = chunks.len();
                        chunks = merge_chunks(&chunks, &hop_fused.chunks);
                        if pipeline.run_rerank {
                            chunks = rerank_overlap(query, &chunks, config.retrieval.rerank_top_n);
                        }
                        trace.record(
                            "expand",
                            json!({
                                "followup": followup,
                                "evidence_before": before,
                                "evidence_after": chunks.len(),
                            }),
                            stage_start.elapsed().as_secs_f64() * 1000.0,
                        );
                        expanded = true;
                        stage = AnswerStage::Synthesize;
                    }
                    None => {
                        stage = AnswerStage::MaybeRepair;
                    }
                }
            }
            AnswerStage::MaybeRepair => {
                let result = verification.as_ref().expect("repair follows verify");
                if result.decision != Decision::Repair || budget.repairs == 0 {
                    stage = AnswerStage::Finalize;
                    continue;
                }

                budget.take_repair()?;
                let stage_start = Instant::now();
                let current = draft.as_ref().expect("draft exists");
                let repaired = repair(
                    &config.verifier,
                    query,
                    current,
                    &chunks,
                    pipeline.verifier_mode,
                    intent,
                )?;

                let outcome = match repaired {
                    Some(repaired_draft) => {
                        let reverified = verify(
                            &config.verifier,
                            query,
                            &repaired_draft,
                            &chunks,
                            pipeline.verifier_mode,
                            intent,
                        )?;
                        let outcome = if reverified.decision == Decision::Answer {
                            "successful"
                        } else {
                            "harmful"
                        };
                        draft = Some(repaired_draft);
                        verification = Some(reverified);
                        outcome
                    }
                    None => "unsuccessful",
                };
                trace.record(
                    "repair",
                    json!({"outcome": outcome}),
                    stage_start.elapsed().as_secs_f64() * 1000.0,
                );
                stage = AnswerStage::Finalize;
            }
            AnswerStage::Finalize => break,
        }
    }

    // A decision the budget refused to act on terminates as abstain.
    if let Some(result) = verification.as_mut() {
        result.queries_searched = searched_queries.clone();
        if result.decision == Decision::Repair {
            result.decision = Decision::Abstain;
            result.decision_path.push("repair_budget_exhausted".to_string());
            if result.abstain_reason.is_none() {
                result.abstain_reason =
                    Some("Evidence could not support the answer within repair bounds.".to_string());
            }
        }
    }

    let answered = verification
        .as_ref()
        .map(|v| v.decision == Decision::Answer)
        .unwrap_or(false);
    trace.record(
        if answered { "answer_done" } else { "abstain_done" },
        json!({
            "claims": draft.as_ref().map(|d| d.claims.len()).unwrap_or(0),
            "queries_searched": searched_queries,
        }),
        0.0,
    );

    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
    log_run(&pool, &run_id, query, intent.as_str(), &trace, latency_ms).await?;
    pool.close().await;

    info!(
        run_id = %run_id,
        intent = intent.as_str(),
        answered,
        latency_ms,
        "run complete"
    );

    Ok(OrchestrationResult {
        run_id,
        mode,
        intent,
        chunks,
        answer: draft,
        verification,
        latency_ms,
    })
}
