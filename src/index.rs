//! Vector index builds and the manifest discipline.
//!
//! A build snapshots the chunk store in deterministic order, embeds every
//! chunk, writes a packed vector store file, and records an
//! [`IndexManifest`] binding the build to the exact snapshot it saw. The
//! previous active manifest is flipped off and the new one on inside a
//! single transaction, so readers always observe one fully-formed manifest
//! and a failed build leaves the prior one active.
//!
//! Builds are single-writer; concurrent queries keep reading the previous
//! manifest until the flip commits.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::embedding::{blob_to_vec, create_backend, vec_to_blob};
use crate::models::{IndexManifest, IndexSummary};

/// Order-independent hash over a set of `(chunk_id, content_hash)` pairs.
/// Any add, remove, or edit changes it.
pub fn snapshot_hash_from_pairs(mut pairs: Vec<(String, String)>) -> String {
    pairs.sort();
    let mut digest = Sha256::new();
    for (chunk_id, content_hash) in &pairs {
        digest.update(chunk_id.as_bytes());
        digest.update(b":");
        digest.update(content_hash.as_bytes());
        digest.update(b"|");
    }
    format!("{:x}", digest.finalize())
}

/// Hash the chunk store as it exists right now.
pub async fn compute_chunk_snapshot_hash(pool: &SqlitePool) -> Result<String> {
    let rows = sqlx::query("SELECT chunk_id, content_hash FROM chunks")
        .fetch_all(pool)
        .await?;

    let pairs: Vec<(String, String)> = rows
        .iter()
        .map(|row| (row.get("chunk_id"), row.get("content_hash")))
        .collect();
    Ok(snapshot_hash_from_pairs(pairs))
}

/// Resolve the currently active manifest, if any.
pub async fn get_active_manifest(pool: &SqlitePool) -> Result<Option<IndexManifest>> {
    let row = sqlx::query(
        r#"
        SELECT index_id, model_name, dim, chunk_count, chunk_snapshot_hash,
               vector_store_path, created_at, active
        FROM index_manifests
        WHERE active = 1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| IndexManifest {
        index_id: row.get("index_id"),
        model_name: row.get("model_name"),
        dim: row.get::<i64, _>("dim") as usize,
        chunk_count: row.get("chunk_count"),
        chunk_snapshot_hash: row.get("chunk_snapshot_hash"),
        vector_store_path: row.get("vector_store_path"),
        created_at: row.get("created_at"),
        active: row.get::<i64, _>("active") != 0,
    }))
}

/// Ordered `vector_id → chunk_id` mapping for one index build.
pub async fn get_embedding_mapping(pool: &SqlitePool, index_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT vector_id, chunk_id FROM embeddings WHERE index_id = ? ORDER BY vector_id",
    )
    .bind(index_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|row| row.get("chunk_id")).collect())
}

/// Read a packed vector store file back into per-chunk vectors.
pub fn load_vector_store(path: &Path, dim: usize) -> Result<Vec<Vec<f32>>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read vector store: {}", path.display()))?;
    if dim == 0 || bytes.len() % (dim * 4) != 0 {
        bail!(
            "Vector store {} is not a whole number of {}-dim vectors",
            path.display(),
            dim
        );
    }
    Ok(bytes
        .chunks_exact(dim * 4)
        .map(blob_to_vec)
        .collect())
}

/// Build a new vector index over the current chunk store and activate it.
pub async fn build_vector_index(config: &Config) -> Result<IndexSummary> {
    let start = Instant::now();
    let pool = db::connect(config).await?;
    let backend = create_backend(&config.embedding)?;

    // 1. Snapshot the chunk set in deterministic order.
    let rows = sqlx::query("SELECT chunk_id, chunk_text, content_hash FROM chunks ORDER BY chunk_id")
        .fetch_all(&pool)
        .await?;
    let chunk_ids: Vec<String> = rows.iter().map(|row| row.get("chunk_id")).collect();
    let texts: Vec<String> = rows.iter().map(|row| row.get("chunk_text")).collect();

    // Hash the snapshot we actually read, not a later re-query.
    let pairs: Vec<(String, String)> = rows
        .iter()
        .map(|row| (row.get("chunk_id"), row.get("content_hash")))
        .collect();
    let snapshot_hash = snapshot_hash_from_pairs(pairs);

    // 2. Embed the snapshot in batches.
    let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
    for batch in texts.chunks(config.embedding.batch_size.max(1)) {
        let mut embedded = backend.embed_texts(batch).await?;
        vectors.append(&mut embedded);
    }
    if vectors.len() != chunk_ids.len() {
        bail!(
            "Embedding backend returned {} vectors for {} chunks",
            vectors.len(),
            chunk_ids.len()
        );
    }

    // 3. Write the packed vector store file for this build.
    let index_id = format!("idx_{}", Uuid::new_v4().simple());
    let index_dir = config.index.resolve_dir(&config.db.path);
    std::fs::create_dir_all(&index_dir)?;
    let store_path = index_dir.join(format!("{}.vec", index_id));
    let mut packed = Vec::with_capacity(vectors.len() * config.embedding.dims * 4);
    for vec in &vectors {
        packed.extend_from_slice(&vec_to_blob(vec));
    }
    std::fs::write(&store_path, &packed)
        .with_context(|| format!("Failed to write vector store: {}", store_path.display()))?;

    // 4–5. Persist the mapping and manifest, and flip the active pointer,
    // in one transaction. Readers never see a half-built index.
    let mut tx = pool.begin().await?;

    for (vector_id, chunk_id) in chunk_ids.iter().enumerate() {
        sqlx::query(
            "INSERT INTO embeddings (index_id, vector_id, chunk_id, model_name, dim) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&index_id)
        .bind(vector_id as i64)
        .bind(chunk_id)
        .bind(backend.model_name())
        .bind(backend.dims() as i64)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE index_manifests SET active = 0 WHERE active = 1")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        INSERT INTO index_manifests (
            index_id, model_name, dim, chunk_count, chunk_snapshot_hash,
            vector_store_path, created_at, active
        ) VALUES (?, ?, ?, ?, ?, ?, ?, 1)
        "#,
    )
    .bind(&index_id)
    .bind(backend.model_name())
    .bind(backend.dims() as i64)
    .bind(chunk_ids.len() as i64)
    .bind(&snapshot_hash)
    .bind(store_path.to_string_lossy().as_ref())
    .bind(chrono::Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    pool.close().await;

    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    info!(
        index_id = %index_id,
        chunks = chunk_ids.len(),
        model = backend.model_name(),
        "vector index built"
    );

    Ok(IndexSummary {
        index_id,
        chunks_indexed: chunk_ids.len(),
        model_name: backend.model_name().to_string(),
        dim: backend.dims(),
        elapsed_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(id: &str, hash: &str) -> (String, String) {
        (id.to_string(), hash.to_string())
    }

    #[test]
    fn test_snapshot_hash_order_independent() {
        let forward = snapshot_hash_from_pairs(vec![pair("ch_a", "1"), pair("ch_b", "2")]);
        let reverse = snapshot_hash_from_pairs(vec![pair("ch_b", "2"), pair("ch_a", "1")]);
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_snapshot_hash_sensitive_to_membership_and_content() {
        let base = snapshot_hash_from_pairs(vec![pair("ch_a", "1"), pair("ch_b", "2")]);
        let added = snapshot_hash_from_pairs(vec![
            pair("ch_a", "1"),
            pair("ch_b", "2"),
            pair("ch_c", "3"),
        ]);
        let removed = snapshot_hash_from_pairs(vec![pair("ch_a", "1")]);
        let edited = snapshot_hash_from_pairs(vec![pair("ch_a", "1"), pair("ch_b", "9")]);
        assert_ne!(base, added);
        assert_ne!(base, removed);
        assert_ne!(base, edited);
    }

    #[test]
    fn test_vector_store_roundtrip() {
        let dir = std::env::temp_dir().join("evi-index-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roundtrip.vec");

        let vectors = vec![vec![0.5f32, -0.5, 0.25], vec![1.0, 0.0, -1.0]];
        let mut packed = Vec::new();
        for v in &vectors {
            packed.extend_from_slice(&vec_to_blob(v));
        }
        std::fs::write(&path, &packed).unwrap();

        let loaded = load_vector_store(&path, 3).unwrap();
        assert_eq!(loaded, vectors);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_vector_store_rejects_ragged_file() {
        let dir = std::env::temp_dir().join("evi-index-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ragged.vec");
        std::fs::write(&path, [0u8; 10]).unwrap();

        assert!(load_vector_store(&path, 3).is_err());
        std::fs::remove_file(&path).ok();
    }
}
