//! # Evidence Harness CLI (`evi`)
//!
//! The `evi` binary is the primary interface for Evidence Harness. It
//! provides commands for database initialization, corpus ingestion, vector
//! index builds, search, grounded answering, and run inspection.
//!
//! ## Usage
//!
//! ```bash
//! evi --config ./config/evi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `evi init` | Create the SQLite database and run schema migrations |
//! | `evi ingest` | Ingest text/Markdown files from the configured corpus root |
//! | `evi index` | Build and atomically activate a new vector index |
//! | `evi search "<query>"` | Ranked evidence search (lexical + vector + RRF) |
//! | `evi answer "<query>"` | Citation-backed answer or abstain-with-rationale |
//! | `evi runs` | List recorded runs with their stage traces |
//! | `evi stats` | Corpus, index, and run statistics |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use evidence_harness::index::build_vector_index;
use evidence_harness::orchestrate::{Mode, QueryOptions};
use evidence_harness::retrieval::SearchFilters;
use evidence_harness::{config, ingest, migrate, orchestrate, stats, trace};

/// Evidence Harness CLI — a local evidence-grounded retrieval and
/// answering engine.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/evi.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "evi",
    about = "Evidence Harness — a local evidence-grounded retrieval and answering engine",
    version,
    long_about = "Evidence Harness indexes a local document corpus for lexical and semantic \
    search, fuses the rankings with Reciprocal Rank Fusion, and answers questions with \
    citation-backed claims verified against retrieved evidence — or abstains with a rationale."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/evi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunks_fts, embeddings, index_manifests, runs).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Ingest text and Markdown files from the corpus root.
    ///
    /// Scans the configured root (or `--root`), chunks each document, and
    /// writes chunks plus their full-text index rows. Files whose content
    /// hash is already present are skipped.
    Ingest {
        /// Override the configured corpus root directory.
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Build a new vector index and activate it.
    ///
    /// Embeds every chunk with the configured backend, writes the vector
    /// store file, and atomically swaps the active manifest. Queries keep
    /// serving the previous index until the swap commits.
    Index,

    /// Search indexed evidence.
    ///
    /// Routes the query, runs lexical and (policy permitting) vector
    /// retrieval, fuses the rankings, and prints ranked chunks.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        top_k: Option<usize>,

        /// Skip vector retrieval even if the routed policy enables it.
        #[arg(long)]
        no_vector: bool,

        /// Only search documents of this source type (markdown, text).
        #[arg(long)]
        source_type: Option<String>,

        /// Only search documents whose path starts with this prefix.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Emit machine-readable JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Answer a question with citation-backed claims.
    ///
    /// Runs the full pipeline: routing, retrieval, extractive synthesis,
    /// verification, and the bounded expansion/repair loop. Terminates in
    /// either a cited answer or an abstention with the searched queries.
    Answer {
        /// The question to answer.
        query: String,

        /// Maximum number of evidence chunks to retrieve.
        #[arg(long)]
        top_k: Option<usize>,

        /// Skip vector retrieval even if the routed policy enables it.
        #[arg(long)]
        no_vector: bool,

        /// Emit machine-readable JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// List recorded runs with their stage traces.
    Runs {
        /// Maximum number of runs to show.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Show corpus, index, and run statistics.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { root } => {
            let summary = ingest::run_ingest(&cfg, root.as_deref()).await?;
            println!("ingest");
            println!("  files seen: {}", summary.files_seen);
            println!("  documents added: {}", summary.documents_added);
            println!("  chunks added: {}", summary.chunks_added);
            println!("  duplicates skipped: {}", summary.duplicates_skipped);
            println!("  files skipped: {}", summary.files_skipped);
            println!("ok");
        }
        Commands::Index => {
            let summary = build_vector_index(&cfg).await?;
            println!("index {}", summary.index_id);
            println!("  chunks indexed: {}", summary.chunks_indexed);
            println!("  model: {} ({} dims)", summary.model_name, summary.dim);
            println!("  elapsed: {:.1} ms", summary.elapsed_ms);
            println!("ok");
        }
        Commands::Search {
            query,
            top_k,
            no_vector,
            source_type,
            path_prefix,
            json,
        } => {
            let options = QueryOptions {
                top_k,
                run_vector: if no_vector { Some(false) } else { None },
                filters: SearchFilters {
                    source_type,
                    path_prefix,
                },
            };
            let result = orchestrate::run_query(&cfg, &query, Mode::Search, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result.to_output_json())?);
            } else {
                print_search_result(&result);
            }
        }
        Commands::Answer {
            query,
            top_k,
            no_vector,
            json,
        } => {
            let options = QueryOptions {
                top_k,
                run_vector: if no_vector { Some(false) } else { None },
                filters: SearchFilters::default(),
            };
            let result = orchestrate::run_query(&cfg, &query, Mode::Answer, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result.to_output_json())?);
            } else {
                print_answer_result(&result);
            }
        }
        Commands::Runs { limit } => {
            trace::run_list_runs(&cfg, limit).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

fn print_search_result(result: &orchestrate::OrchestrationResult) {
    if result.chunks.is_empty() {
        println!("No results.");
        return;
    }
    println!(
        "intent: {}   results: {}   ({:.1} ms)",
        result.intent.as_str(),
        result.chunks.len(),
        result.latency_ms
    );
    println!();
    for (i, chunk) in result.chunks.iter().enumerate() {
        let excerpt: String = chunk.chunk_text.chars().take(160).collect();
        println!("{}. [{:.4}] {}", i + 1, chunk.score, chunk.source_path);
        if let Some(page) = chunk.page {
            println!("    page: {}", page);
        }
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    chunk: {}", chunk.chunk_id);
        println!();
    }
}

fn print_answer_result(result: &orchestrate::OrchestrationResult) {
    let output = result.to_output_json();

    if output.get("abstain").and_then(|a| a.as_bool()).unwrap_or(false) {
        println!("No answer (abstained).");
        if let Some(reason) = output.get("reason").and_then(|r| r.as_str()) {
            println!("  reason: {}", reason);
        }
        if let Some(queries) = output.get("queries_searched").and_then(|q| q.as_array()) {
            println!("  queries searched:");
            for query in queries {
                if let Some(q) = query.as_str() {
                    println!("    - {}", q);
                }
            }
        }
        return;
    }

    println!(
        "intent: {}   ({:.1} ms)",
        result.intent.as_str(),
        result.latency_ms
    );
    println!();
    if let Some(draft) = &result.answer {
        for claim in &draft.claims {
            println!("- {}", claim.text);
            for citation in &claim.citations {
                println!(
                    "    [{}:{}..{}] {}",
                    citation.chunk_id, citation.span_start, citation.span_end, citation.source_path
                );
            }
        }
    }
    if let Some(verification) = &result.verification {
        if !verification.conflicts.is_empty() {
            println!();
            println!("conflicting sources:");
            for conflict in &verification.conflicts {
                println!("  ! {}", conflict.describe());
            }
        }
        println!();
        println!("confidence: {:.2}", verification.confidence);
    }
}
