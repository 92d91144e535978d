//! Database statistics and health overview.
//!
//! Provides a quick summary of what's indexed: document counts, chunk
//! counts, the active index manifest, and recorded run totals. Used by
//! `evi stats` to give confidence that ingestion and index builds are
//! working as expected.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::index::{compute_chunk_snapshot_hash, get_active_manifest};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let total_docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(&pool)
        .await?;

    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;

    let total_runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs")
        .fetch_one(&pool)
        .await?;

    let manifest = get_active_manifest(&pool).await?;
    let snapshot = compute_chunk_snapshot_hash(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Evidence Harness — Database Stats");
    println!("=================================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {}", total_docs);
    println!("  Chunks:      {}", total_chunks);
    println!("  Runs:        {}", total_runs);
    println!();

    match manifest {
        Some(manifest) => {
            let fresh = manifest.chunk_snapshot_hash == snapshot;
            println!("  Active index: {}", manifest.index_id);
            println!("    model:      {} ({} dims)", manifest.model_name, manifest.dim);
            println!("    chunks:     {}", manifest.chunk_count);
            println!("    built:      {}", manifest.created_at);
            println!(
                "    status:     {}",
                if fresh { "fresh" } else { "STALE — rebuild with `evi index`" }
            );
        }
        None => {
            println!("  Active index: none (vector search unavailable)");
        }
    }

    pool.close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[unit])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
