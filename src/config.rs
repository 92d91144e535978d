use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::router::RouterPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub router: RouterPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_chunk_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    120
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    pub root: Option<PathBuf>,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// RRF smoothing constant; larger values flatten rank-1 dominance.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: u32,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    /// Rerank touches only this many fused results.
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
    /// Fall back to lexical-only search when the vector index is stale.
    #[serde(default = "default_true")]
    pub lexical_fallback_on_stale: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_k: default_candidate_k(),
            rerank_top_n: default_rerank_top_n(),
            lexical_fallback_on_stale: true,
        }
    }
}

fn default_rrf_k() -> u32 {
    60
}
fn default_candidate_k() -> i64 {
    80
}
fn default_rerank_top_n() -> usize {
    24
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            model: default_model(),
            dims: default_dims(),
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_backend() -> String {
    "hash".to_string()
}
fn default_model() -> String {
    "hash-embed-v1".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    /// Directory for vector store files; defaults to `<db dir>/indexes`.
    pub dir: Option<PathBuf>,
}

impl IndexConfig {
    pub fn resolve_dir(&self, db_path: &Path) -> PathBuf {
        match &self.dir {
            Some(dir) => dir.clone(),
            None => db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("indexes"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VerifierConfig {
    /// Minimum token-overlap ratio for a claim to count as supported.
    #[serde(default = "default_claim_support_min")]
    pub claim_support_min: f64,
    #[serde(default = "default_query_alignment_min")]
    pub query_alignment_min: f64,
    #[serde(default = "default_citation_span_quality_min")]
    pub citation_span_quality_min: f64,
    #[serde(default = "default_critical_coverage_min")]
    pub critical_coverage_min: f64,
    #[serde(default = "default_aggregate_min")]
    pub aggregate_min: f64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            claim_support_min: default_claim_support_min(),
            query_alignment_min: default_query_alignment_min(),
            citation_span_quality_min: default_citation_span_quality_min(),
            critical_coverage_min: default_critical_coverage_min(),
            aggregate_min: default_aggregate_min(),
        }
    }
}

fn default_claim_support_min() -> f64 {
    0.6
}
fn default_query_alignment_min() -> f64 {
    0.34
}
fn default_citation_span_quality_min() -> f64 {
    0.18
}
fn default_critical_coverage_min() -> f64 {
    0.34
}
fn default_aggregate_min() -> f64 {
    0.55
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    if config.chunking.chunk_chars == 0 {
        anyhow::bail!("chunking.chunk_chars must be > 0");
    }
    if config.chunking.overlap_chars >= config.chunking.chunk_chars {
        anyhow::bail!("chunking.overlap_chars must be smaller than chunking.chunk_chars");
    }

    // Validate retrieval
    if config.retrieval.candidate_k < 1 {
        anyhow::bail!("retrieval.candidate_k must be >= 1");
    }

    // Validate embedding
    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }
    match config.embedding.backend.as_str() {
        "hash" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding backend: '{}'. Must be hash or openai.",
            other
        ),
    }

    // Validate verifier thresholds
    for (name, value) in [
        ("claim_support_min", config.verifier.claim_support_min),
        ("query_alignment_min", config.verifier.query_alignment_min),
        (
            "citation_span_quality_min",
            config.verifier.citation_span_quality_min,
        ),
        (
            "critical_coverage_min",
            config.verifier.critical_coverage_min,
        ),
        ("aggregate_min", config.verifier.aggregate_min),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("verifier.{} must be in [0.0, 1.0]", name);
        }
    }

    config.router.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str("[db]\npath = \"/tmp/evi.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.chunk_chars, 1000);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.embedding.backend, "hash");
        assert_eq!(config.embedding.dims, 384);
        assert!((config.verifier.claim_support_min - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_index_dir_defaults_next_to_db() {
        let config: Config = toml::from_str("[db]\npath = \"/data/evi.sqlite\"\n").unwrap();
        let dir = config.index.resolve_dir(&config.db.path);
        assert_eq!(dir, PathBuf::from("/data/indexes"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let toml_src = r#"
[db]
path = "/tmp/evi.sqlite"

[chunking]
chunk_chars = 100
overlap_chars = 100
"#;
        let tmp = std::env::temp_dir().join("evi-config-overlap-test.toml");
        std::fs::write(&tmp, toml_src).unwrap();
        let result = load_config(&tmp);
        std::fs::remove_file(&tmp).ok();
        assert!(result.is_err());
    }
}
