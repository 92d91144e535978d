//! Core data models shared across the retrieval and answering pipeline.
//!
//! These types represent the documents, chunks, claims, and verification
//! verdicts that flow from ingestion through retrieval to the final cited
//! answer (or abstention).

use serde::Serialize;

use crate::error::EngineError;

/// Normalized document stored in SQLite. Immutable once ingested;
/// re-ingestion with an identical content hash is a no-op.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: String,
    pub source_path: String,
    pub source_type: String,
    pub title: String,
    pub tags: Vec<String>,
    pub created_at: String,
    pub content_hash: String,
}

/// A contiguous text span of a document. `chunk_id` is derived from the
/// owning document, offsets, and text, so re-ingestion yields identical IDs.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_text: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub section: Option<String>,
    pub page: Option<i64>,
    /// SHA-256 of `chunk_text`; feeds the index snapshot hash.
    pub content_hash: String,
}

/// A chunk paired with a retrieval score. Scores are always
/// higher-is-better regardless of the backing engine.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub score: f64,
    pub chunk_text: String,
    pub source_path: String,
    pub page: Option<i64>,
}

/// One ranked list produced by a single retrieval channel or by fusion.
#[derive(Debug, Clone)]
pub struct RankedChunks {
    pub query: String,
    pub mode: String,
    pub chunks: Vec<ScoredChunk>,
    pub latency_ms: f64,
}

impl RankedChunks {
    pub fn empty(query: &str, mode: &str) -> Self {
        Self {
            query: query.to_string(),
            mode: mode.to_string(),
            chunks: Vec::new(),
            latency_ms: 0.0,
        }
    }
}

/// Character-span citation into a retrieved chunk.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub source_path: String,
    pub page: Option<i64>,
    pub span_start: usize,
    pub span_end: usize,
}

/// An extractive assertion backed by at least one citation.
///
/// Claims are immutable values: the repair pass replaces a claim rather
/// than mutating it, so the tool trace can show before/after citations.
#[derive(Debug, Clone, Serialize)]
pub struct Claim {
    pub claim_id: String,
    pub text: String,
    pub citations: Vec<Citation>,
}

impl Claim {
    /// Build a claim, enforcing the citation invariant at construction time.
    pub fn new(
        claim_id: impl Into<String>,
        text: impl Into<String>,
        citations: Vec<Citation>,
    ) -> Result<Self, EngineError> {
        let claim_id = claim_id.into();
        if citations.is_empty() {
            return Err(EngineError::MalformedClaim { claim_id });
        }
        Ok(Self {
            claim_id,
            text: text.into(),
            citations,
        })
    }
}

/// Draft produced by the synthesizer, before verification.
#[derive(Debug, Clone)]
pub struct DraftAnswer {
    pub claims: Vec<Claim>,
    pub searched_queries: Vec<String>,
}

/// Per-claim verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimVerdict {
    Supported,
    Unsupported,
    Conflicted,
}

/// Overall verification decision for one verify pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Answer,
    Repair,
    Abstain,
}

/// A single problem found during verification.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationIssue {
    pub kind: String,
    pub claim_id: Option<String>,
    pub detail: String,
}

/// Two or more sources asserting different values for the same subject.
/// Both sides are always carried together; the pipeline never picks one.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictReport {
    pub subject: String,
    /// Each asserted value with the chunk ids that back it.
    pub values: Vec<(String, Vec<String>)>,
}

impl ConflictReport {
    pub fn describe(&self) -> String {
        let sides: Vec<String> = self
            .values
            .iter()
            .map(|(value, sources)| format!("{} ({})", value, sources.join(", ")))
            .collect();
        format!("Conflict for '{}': {}", self.subject, sides.join(" vs "))
    }
}

/// Outcome of one verification pass over a draft answer.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub verdicts: Vec<(String, ClaimVerdict)>,
    pub decision: Decision,
    pub issues: Vec<VerificationIssue>,
    pub conflicts: Vec<ConflictReport>,
    pub verdict_code: String,
    pub confidence: f64,
    pub decision_path: Vec<String>,
    pub abstain_reason: Option<String>,
    /// Every query actually searched this run; the abstain rationale.
    pub queries_searched: Vec<String>,
}

impl VerificationResult {
    pub fn verdict_for(&self, claim_id: &str) -> Option<ClaimVerdict> {
        self.verdicts
            .iter()
            .find(|(id, _)| id == claim_id)
            .map(|(_, v)| *v)
    }
}

/// Versioned binding of a vector index build to an exact chunk snapshot.
#[derive(Debug, Clone)]
pub struct IndexManifest {
    pub index_id: String,
    pub model_name: String,
    pub dim: usize,
    pub chunk_count: i64,
    pub chunk_snapshot_hash: String,
    pub vector_store_path: String,
    pub created_at: String,
    pub active: bool,
}

/// Counters reported after an ingest pass.
#[derive(Debug, Default)]
pub struct IngestSummary {
    pub files_seen: u64,
    pub documents_added: u64,
    pub chunks_added: u64,
    pub duplicates_skipped: u64,
    pub files_skipped: u64,
}

/// Counters reported after a vector index build.
#[derive(Debug)]
pub struct IndexSummary {
    pub index_id: String,
    pub chunks_indexed: usize,
    pub model_name: String,
    pub dim: usize,
    pub elapsed_ms: f64,
}
