//! Retrieval channels and rank fusion.
//!
//! Three entry points, all returning higher-is-better scores with ties
//! broken by `chunk_id` ascending:
//! - [`search_lexical`] — FTS5/BM25 over chunk text, with the raw query
//!   sanitized into quoted tokens so user input never reaches FTS5 syntax.
//! - [`search_vector`] — cosine scan over the active index's vector store,
//!   behind the manifest staleness gate.
//! - [`fuse_hybrid`] — Reciprocal Rank Fusion of the two channels.
//!
//! # Fusion
//!
//! Rank positions start at 1 in each input list. A chunk's contribution
//! from the lexical list is `lexical_weight / (rrf_k + rank)`; from the
//! vector list it is `1 / (rrf_k + rank)`. Its fused score is the sum over
//! the lists it appears in; absence from a list contributes nothing.

use anyhow::Result;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Instant;
use tracing::debug;

use crate::config::Config;
use crate::embedding::{cosine_similarity, create_backend, embed_query};
use crate::error::EngineError;
use crate::index::{compute_chunk_snapshot_hash, get_active_manifest, get_embedding_mapping, load_vector_store};
use crate::models::{RankedChunks, ScoredChunk};

static FTS_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9_]{2,}").expect("static pattern"));

/// Optional metadata filters applied to both retrieval channels.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict to documents of this source type (`"markdown"`, `"text"`).
    pub source_type: Option<String>,
    /// Restrict to documents whose source path starts with this prefix.
    pub path_prefix: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.source_type.is_none() && self.path_prefix.is_none()
    }
}

/// Convert a raw query into a safe FTS5 MATCH expression: lowercased
/// tokens, deduplicated, capped at 12, each double-quoted, OR-joined.
fn to_fts5_query(query: &str) -> String {
    let lowered = query.to_lowercase();
    let mut seen = Vec::new();
    for token in FTS_TOKEN_RE.find_iter(&lowered) {
        let token = token.as_str();
        if !seen.iter().any(|t: &String| t == token) {
            seen.push(token.to_string());
        }
        if seen.len() == 12 {
            break;
        }
    }
    seen.iter()
        .map(|token| format!("\"{}\"", token))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Full-text search over chunk text. Returns an empty list (not an error)
/// when no terms match.
pub async fn search_lexical(
    pool: &SqlitePool,
    query: &str,
    filters: &SearchFilters,
    k: i64,
) -> Result<RankedChunks> {
    let start = Instant::now();
    let fts_query = to_fts5_query(query);
    if fts_query.is_empty() {
        return Ok(RankedChunks::empty(query, "lexical"));
    }

    // bm25() is smaller-is-better; order on it directly and negate after.
    let mut sql = String::from(
        "SELECT f.chunk_id AS chunk_id, bm25(chunks_fts) AS score \
         FROM chunks_fts f JOIN documents d ON d.doc_id = f.doc_id \
         WHERE chunks_fts MATCH ?",
    );
    if filters.source_type.is_some() {
        sql.push_str(" AND d.source_type = ?");
    }
    if filters.path_prefix.is_some() {
        sql.push_str(" AND substr(d.source_path, 1, ?) = ?");
    }
    sql.push_str(" ORDER BY score, f.chunk_id LIMIT ?");

    let mut query_builder = sqlx::query(&sql).bind(&fts_query);
    if let Some(source_type) = &filters.source_type {
        query_builder = query_builder.bind(source_type);
    }
    if let Some(prefix) = &filters.path_prefix {
        query_builder = query_builder.bind(prefix.len() as i64).bind(prefix);
    }
    let rows = query_builder.bind(k).fetch_all(pool).await?;

    let hits: Vec<(String, f64)> = rows
        .iter()
        .map(|row| (row.get("chunk_id"), -row.get::<f64, _>("score")))
        .collect();
    let chunks = hydrate_chunks(pool, &hits).await?;

    Ok(RankedChunks {
        query: query.to_string(),
        mode: "lexical".to_string(),
        chunks,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Vector search behind the manifest gate.
///
/// Refuses with [`EngineError::StaleIndex`] when the active manifest does
/// not describe the live chunk store and the configured backend — a
/// mismatch must surface as staleness, never as silently wrong results.
pub async fn search_vector(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    filters: &SearchFilters,
    k: i64,
) -> Result<RankedChunks> {
    let start = Instant::now();

    let manifest = match get_active_manifest(pool).await? {
        Some(manifest) => manifest,
        None => {
            return Err(EngineError::StaleIndex {
                reason: "no active index manifest; run `evi index` first".to_string(),
            }
            .into())
        }
    };

    if manifest.model_name != config.embedding.model || manifest.dim != config.embedding.dims {
        return Err(EngineError::StaleIndex {
            reason: format!(
                "manifest built with {}/{} but backend is configured as {}/{}",
                manifest.model_name, manifest.dim, config.embedding.model, config.embedding.dims
            ),
        }
        .into());
    }

    let store_path = Path::new(&manifest.vector_store_path);
    if !store_path.exists() {
        return Err(EngineError::StaleIndex {
            reason: format!("vector store missing: {}", manifest.vector_store_path),
        }
        .into());
    }

    let mapping = get_embedding_mapping(pool, &manifest.index_id).await?;
    let vectors = load_vector_store(store_path, manifest.dim)?;
    if vectors.len() as i64 != manifest.chunk_count || mapping.len() as i64 != manifest.chunk_count
    {
        return Err(EngineError::StaleIndex {
            reason: format!(
                "manifest records {} chunks but store has {} vectors and {} mappings",
                manifest.chunk_count,
                vectors.len(),
                mapping.len()
            ),
        }
        .into());
    }

    let snapshot = compute_chunk_snapshot_hash(pool).await?;
    if snapshot != manifest.chunk_snapshot_hash {
        return Err(EngineError::StaleIndex {
            reason: "chunk store changed since the active index was built".to_string(),
        }
        .into());
    }

    let backend = create_backend(&config.embedding)?;
    let query_vec = embed_query(backend.as_ref(), query).await?;

    let mut hits: Vec<(String, f64)> = vectors
        .iter()
        .zip(mapping.iter())
        .map(|(vec, chunk_id)| {
            (
                chunk_id.clone(),
                cosine_similarity(&query_vec, vec) as f64,
            )
        })
        .collect();
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    // Metadata filters apply before the cut so a filtered search still
    // fills up to k results.
    if filters.is_empty() {
        hits.truncate(k as usize);
    }

    let mut chunks = hydrate_filtered_chunks(pool, &hits, filters).await?;
    chunks.truncate(k as usize);
    debug!(hits = chunks.len(), "vector search served from manifest");

    Ok(RankedChunks {
        query: query.to_string(),
        mode: "vector".to_string(),
        chunks,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
    })
}

/// Attach chunk text and document metadata to scored hits, preserving the
/// hit order.
async fn hydrate_chunks(pool: &SqlitePool, hits: &[(String, f64)]) -> Result<Vec<ScoredChunk>> {
    hydrate_filtered_chunks(pool, hits, &SearchFilters::default()).await
}

async fn hydrate_filtered_chunks(
    pool: &SqlitePool,
    hits: &[(String, f64)],
    filters: &SearchFilters,
) -> Result<Vec<ScoredChunk>> {
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; hits.len()].join(",");
    let sql = format!(
        r#"
        SELECT chunks.chunk_id, chunks.doc_id, chunks.chunk_text, chunks.page,
               documents.source_path, documents.source_type
        FROM chunks
        JOIN documents ON chunks.doc_id = documents.doc_id
        WHERE chunks.chunk_id IN ({})
        "#,
        placeholders
    );

    let mut query = sqlx::query(&sql);
    for (chunk_id, _) in hits {
        query = query.bind(chunk_id);
    }
    let rows = query.fetch_all(pool).await?;

    let mut by_id: HashMap<String, (String, String, Option<i64>, String, String)> = HashMap::new();
    for row in &rows {
        by_id.insert(
            row.get("chunk_id"),
            (
                row.get("doc_id"),
                row.get("chunk_text"),
                row.get("page"),
                row.get("source_path"),
                row.get("source_type"),
            ),
        );
    }

    Ok(hits
        .iter()
        .filter_map(|(chunk_id, score)| {
            by_id
                .get(chunk_id)
                .filter(|(_, _, _, source_path, source_type)| {
                    filters
                        .source_type
                        .as_ref()
                        .map_or(true, |want| source_type == want)
                        && filters
                            .path_prefix
                            .as_ref()
                            .map_or(true, |prefix| source_path.starts_with(prefix.as_str()))
                })
                .map(|(doc_id, text, page, source, _)| ScoredChunk {
                    chunk_id: chunk_id.clone(),
                    doc_id: doc_id.clone(),
                    score: *score,
                    chunk_text: text.clone(),
                    source_path: source.clone(),
                    page: *page,
                })
        })
        .collect())
}

/// Reciprocal Rank Fusion of the lexical and vector channels.
///
/// `lexical_weight` multiplies the lexical list's contribution only; the
/// vector contribution weight is fixed at 1.0. Final ordering is fused
/// score descending, ties by `chunk_id` ascending, truncated to `k`.
pub fn fuse_hybrid(
    lexical: &RankedChunks,
    vector: &RankedChunks,
    k: usize,
    rrf_k: u32,
    lexical_weight: f64,
) -> RankedChunks {
    let start = Instant::now();
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut lookup: HashMap<String, &ScoredChunk> = HashMap::new();

    for (rank, chunk) in lexical.chunks.iter().enumerate() {
        let contribution = lexical_weight / (rrf_k as f64 + (rank + 1) as f64);
        *scores.entry(chunk.chunk_id.clone()).or_default() += contribution;
        lookup.entry(chunk.chunk_id.clone()).or_insert(chunk);
    }
    for (rank, chunk) in vector.chunks.iter().enumerate() {
        let contribution = 1.0 / (rrf_k as f64 + (rank + 1) as f64);
        *scores.entry(chunk.chunk_id.clone()).or_default() += contribution;
        lookup.entry(chunk.chunk_id.clone()).or_insert(chunk);
    }

    let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked.truncate(k);

    let fused = ranked
        .into_iter()
        .map(|(chunk_id, score)| {
            let source = lookup[&chunk_id];
            ScoredChunk {
                chunk_id,
                doc_id: source.doc_id.clone(),
                score,
                chunk_text: source.chunk_text.clone(),
                source_path: source.source_path.clone(),
                page: source.page,
            }
        })
        .collect();

    RankedChunks {
        query: lexical.query.clone(),
        mode: "hybrid".to_string(),
        chunks: fused,
        latency_ms: start.elapsed().as_secs_f64() * 1000.0,
    }
}

/// Rerank the top `top_n` fused results by lexical overlap with the query.
///
/// Only the prefix is rescored and re-sorted; results beyond `top_n` keep
/// their fused order, and no chunk is ever added or dropped.
pub fn rerank_overlap(query: &str, chunks: &[ScoredChunk], top_n: usize) -> Vec<ScoredChunk> {
    let query_tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.to_string())
        .collect();

    let split = top_n.min(chunks.len());
    let mut head: Vec<ScoredChunk> = chunks[..split].to_vec();
    for chunk in head.iter_mut() {
        let text = chunk.chunk_text.to_lowercase();
        let overlap = query_tokens
            .iter()
            .filter(|token| text.split_whitespace().any(|t| t == token.as_str()))
            .count();
        chunk.score += overlap as f64 * 0.2;
    }
    head.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    head.extend_from_slice(&chunks[split..]);
    head
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(chunk_id: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: chunk_id.to_string(),
            doc_id: "doc1".to_string(),
            score,
            chunk_text: format!("text for {}", chunk_id),
            source_path: "notes.md".to_string(),
            page: None,
        }
    }

    fn ranked(mode: &str, chunks: Vec<ScoredChunk>) -> RankedChunks {
        RankedChunks {
            query: "q".to_string(),
            mode: mode.to_string(),
            chunks,
            latency_ms: 0.0,
        }
    }

    #[test]
    fn test_fts5_query_sanitizes_operators() {
        let q = to_fts5_query("retention AND policy OR \"NEAR(x)\"");
        for part in q.split(" OR ") {
            assert!(part.starts_with('"') && part.ends_with('"'), "unquoted: {}", part);
        }
        assert!(!q.contains("NEAR("));
    }

    #[test]
    fn test_fts5_query_dedupes_and_caps() {
        let q = to_fts5_query(&"token ".repeat(40));
        assert_eq!(q, "\"token\"");

        let many: String = (0..30).map(|i| format!("word{} ", i)).collect();
        let q = to_fts5_query(&many);
        assert_eq!(q.split(" OR ").count(), 12);
    }

    #[test]
    fn test_fts5_query_empty_for_no_tokens() {
        assert_eq!(to_fts5_query("? ! ."), "");
        assert_eq!(to_fts5_query("a"), "");
    }

    #[test]
    fn test_fusion_score_matches_formula() {
        let lexical = ranked("lexical", vec![scored("ch_a", 9.0), scored("ch_b", 5.0)]);
        let vector = ranked("vector", vec![scored("ch_b", 0.9), scored("ch_c", 0.7)]);

        let fused = fuse_hybrid(&lexical, &vector, 10, 60, 1.5);
        let score_of = |id: &str| {
            fused
                .chunks
                .iter()
                .find(|c| c.chunk_id == id)
                .map(|c| c.score)
                .unwrap()
        };

        // In both lists: lexical rank 2 + vector rank 1.
        let expected_b = 1.5 / (60.0 + 2.0) + 1.0 / (60.0 + 1.0);
        assert!((score_of("ch_b") - expected_b).abs() < 1e-12);
        // Only lexical, rank 1.
        assert!((score_of("ch_a") - 1.5 / 61.0).abs() < 1e-12);
        // Only vector, rank 2.
        assert!((score_of("ch_c") - 1.0 / 62.0).abs() < 1e-12);
    }

    #[test]
    fn test_fusion_rrf_k_flattens_rank_gap() {
        let lexical = ranked("lexical", vec![scored("ch_a", 9.0), scored("ch_b", 5.0)]);
        let vector = ranked("vector", Vec::new());

        let tight = fuse_hybrid(&lexical, &vector, 10, 1, 1.0);
        let loose = fuse_hybrid(&lexical, &vector, 10, 600, 1.0);

        let gap = |fused: &RankedChunks| fused.chunks[0].score - fused.chunks[1].score;
        assert!(gap(&tight) > gap(&loose));
    }

    #[test]
    fn test_fusion_ties_break_by_chunk_id() {
        // Same single-entry rank in each list with weight 1.0: equal scores.
        let lexical = ranked("lexical", vec![scored("ch_z", 3.0)]);
        let vector = ranked("vector", vec![scored("ch_a", 0.5)]);

        let fused = fuse_hybrid(&lexical, &vector, 10, 60, 1.0);
        assert_eq!(fused.chunks[0].chunk_id, "ch_a");
        assert_eq!(fused.chunks[1].chunk_id, "ch_z");
    }

    #[test]
    fn test_fusion_truncates_to_k() {
        let lexical = ranked(
            "lexical",
            (0..8).map(|i| scored(&format!("ch_{}", i), 8.0 - i as f64)).collect(),
        );
        let vector = ranked("vector", Vec::new());
        let fused = fuse_hybrid(&lexical, &vector, 3, 60, 1.0);
        assert_eq!(fused.chunks.len(), 3);
    }

    #[test]
    fn test_rerank_only_touches_top_n() {
        let chunks = vec![
            scored("ch_a", 0.9),
            scored("ch_b", 0.8),
            scored("ch_c", 0.7),
            scored("ch_d", 0.6),
        ];
        let reranked = rerank_overlap("text ch_c", &chunks, 2);

        assert_eq!(reranked.len(), 4);
        // Tail preserved untouched, in order.
        assert_eq!(reranked[2].chunk_id, "ch_c");
        assert_eq!(reranked[3].chunk_id, "ch_d");
        assert!((reranked[2].score - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_rerank_never_adds_chunks() {
        let chunks = vec![scored("ch_a", 0.9), scored("ch_b", 0.8)];
        let reranked = rerank_overlap("anything at all", &chunks, 10);
        let mut ids: Vec<&str> = reranked.iter().map(|c| c.chunk_id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["ch_a", "ch_b"]);
    }
}
