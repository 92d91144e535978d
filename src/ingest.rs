//! Filesystem ingestion: scan → documents → chunks → lexical index.
//!
//! Walks the configured corpus root for plain-text and Markdown files,
//! derives stable document identities from content hashes, chunks each
//! body, and writes chunks plus their FTS5 rows in one transaction per
//! document. Ingestion is idempotent: a file whose content hash is already
//! present is skipped, and unchanged files re-derive identical chunk IDs.
//!
//! Richer format loaders (PDF, HTML, DOCX, …) are deliberately outside
//! this module; they feed the same document/chunk contract from external
//! tooling.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::db;
use crate::models::{Chunk, IngestSummary};

pub async fn run_ingest(config: &Config, root_override: Option<&Path>) -> Result<IngestSummary> {
    let root = match root_override {
        Some(path) => path.to_path_buf(),
        None => config
            .ingest
            .root
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ingest.root is not configured"))?,
    };
    if !root.exists() {
        bail!("Ingest root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.ingest.include_globs)?;
    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.ingest.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let pool = db::connect(config).await?;
    let mut summary = IngestSummary::default();

    let walker = WalkDir::new(&root)
        .follow_links(config.ingest.follow_symlinks)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        summary.files_seen += 1;

        let body = match std::fs::read_to_string(path) {
            Ok(body) => body,
            Err(err) => {
                debug!(path = %path.display(), %err, "skipping unreadable file");
                summary.files_skipped += 1;
                continue;
            }
        };
        if body.trim().is_empty() {
            summary.files_skipped += 1;
            continue;
        }

        let source_type = source_type_for(path);
        let title = title_for(&rel_str, &body);
        let content_hash = sha256_hex(body.as_bytes());

        let existing: Option<String> =
            sqlx::query_scalar("SELECT doc_id FROM documents WHERE content_hash = ?")
                .bind(&content_hash)
                .fetch_optional(&pool)
                .await?;
        if existing.is_some() {
            summary.duplicates_skipped += 1;
            continue;
        }

        let doc_id = derive_doc_id(&rel_str, &content_hash);
        let chunks = chunk_text(
            &doc_id,
            &body,
            config.chunking.chunk_chars,
            config.chunking.overlap_chars,
        );

        insert_document_with_chunks(
            &pool,
            &doc_id,
            &rel_str,
            source_type,
            &title,
            &content_hash,
            &chunks,
        )
        .await?;

        summary.documents_added += 1;
        summary.chunks_added += chunks.len() as u64;
    }

    pool.close().await;
    Ok(summary)
}

/// Stable document identity: hash of the normalized relative path plus the
/// body hash, so moving a file or editing it yields a new document.
pub fn derive_doc_id(normalized_path: &str, content_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_path.as_bytes());
    hasher.update(b"|");
    hasher.update(content_hash.as_bytes());
    format!("doc_{:.32}", format!("{:x}", hasher.finalize()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn source_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("md") | Some("markdown") => "markdown",
        _ => "text",
    }
}

/// First Markdown heading if present, else the file name.
fn title_for(rel_path: &str, body: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix('#') {
            let heading = heading.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return heading.to_string();
            }
        }
        if !trimmed.is_empty() {
            break;
        }
    }
    rel_path
        .rsplit('/')
        .next()
        .unwrap_or(rel_path)
        .to_string()
}

async fn insert_document_with_chunks(
    pool: &SqlitePool,
    doc_id: &str,
    source_path: &str,
    source_type: &str,
    title: &str,
    content_hash: &str,
    chunks: &[Chunk],
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO documents (doc_id, source_path, source_type, title, tags, created_at, content_hash)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(doc_id)
    .bind(source_path)
    .bind(source_type)
    .bind(title)
    .bind("[]")
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(content_hash)
    .execute(&mut *tx)
    .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (chunk_id, doc_id, chunk_text, start_offset, end_offset, section, page, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.doc_id)
        .bind(&chunk.chunk_text)
        .bind(chunk.start_offset)
        .bind(chunk.end_offset)
        .bind(&chunk.section)
        .bind(chunk.page)
        .bind(&chunk.content_hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, doc_id, chunk_text) VALUES (?, ?, ?)")
            .bind(&chunk.chunk_id)
            .bind(&chunk.doc_id)
            .bind(&chunk.chunk_text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_deterministic() {
        let hash = sha256_hex(b"body");
        assert_eq!(derive_doc_id("notes/a.md", &hash), derive_doc_id("notes/a.md", &hash));
        assert_ne!(derive_doc_id("notes/a.md", &hash), derive_doc_id("notes/b.md", &hash));
    }

    #[test]
    fn test_title_prefers_markdown_heading() {
        assert_eq!(title_for("a.md", "# Backup Policy\n\nBody."), "Backup Policy");
        assert_eq!(title_for("dir/notes.txt", "Plain first line."), "notes.txt");
    }

    #[test]
    fn test_source_type_by_extension() {
        assert_eq!(source_type_for(Path::new("a.md")), "markdown");
        assert_eq!(source_type_for(Path::new("a.txt")), "text");
        assert_eq!(source_type_for(Path::new("a")), "text");
    }
}
