//! Offset-preserving sliding-window chunker.
//!
//! Splits document body text into [`Chunk`]s of at most `chunk_chars`
//! characters with a fixed overlap between consecutive windows. Offsets are
//! byte positions into the original body, so citations can point back into
//! the source text.
//!
//! Chunk IDs are a deterministic hash of `(doc_id, start, end, text)`:
//! re-ingesting the same document yields byte-identical IDs, which is what
//! keeps index manifest snapshot hashes stable across runs.

use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Split text into overlapping windows, respecting UTF-8 boundaries.
pub fn chunk_text(doc_id: &str, text: &str, chunk_chars: usize, overlap_chars: usize) -> Vec<Chunk> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let len = trimmed.len();
    let mut start = 0usize;

    while start < len {
        let mut end = (start + chunk_chars).min(len);
        // Back off to a char boundary, then prefer a whitespace break so
        // windows do not cut words in half.
        while end < len && !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        if end < len {
            if let Some(pos) = trimmed[start..end].rfind(char::is_whitespace) {
                if pos > 0 {
                    end = start + pos;
                }
            }
        }
        if end <= start {
            end = (start + chunk_chars).min(len);
            while end < len && !trimmed.is_char_boundary(end) {
                end += 1;
            }
        }

        let piece = trimmed[start..end].trim();
        if !piece.is_empty() {
            chunks.push(make_chunk(doc_id, start as i64, end as i64, piece));
        }

        if end == len {
            break;
        }
        let next = end.saturating_sub(overlap_chars).max(start + 1);
        start = next;
        while start < len && !trimmed.is_char_boundary(start) {
            start += 1;
        }
    }

    chunks
}

fn make_chunk(doc_id: &str, start: i64, end: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_le_bytes());
    hasher.update(end.to_le_bytes());
    hasher.update(b"|");
    hasher.update(text.as_bytes());
    let chunk_id = format!("ch_{:.32}", format!("{:x}", hasher.finalize()));

    let mut content_hasher = Sha256::new();
    content_hasher.update(text.as_bytes());
    let content_hash = format!("{:x}", content_hasher.finalize());

    Chunk {
        chunk_id,
        doc_id: doc_id.to_string(),
        chunk_text: text.to_string(),
        start_offset: start,
        end_offset: end,
        section: None,
        page: None,
        content_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 1000, 120);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_text, "Hello, world!");
        assert_eq!(chunks[0].start_offset, 0);
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        let chunks = chunk_text("doc1", "   \n ", 1000, 120);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_long_text_splits_with_overlap() {
        let text = "word ".repeat(500);
        let chunks = chunk_text("doc1", &text, 200, 40);
        assert!(chunks.len() > 1);
        // Consecutive windows overlap: each chunk starts before the
        // previous one ended.
        for pair in chunks.windows(2) {
            assert!(pair[1].start_offset < pair[0].end_offset);
            assert!(pair[1].start_offset > pair[0].start_offset);
        }
    }

    #[test]
    fn test_chunk_ids_deterministic() {
        let text = "Alpha beta gamma delta. ".repeat(100);
        let first = chunk_text("doc1", &text, 300, 50);
        let second = chunk_text("doc1", &text, 300, 50);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.chunk_id, b.chunk_id);
            assert_eq!(a.content_hash, b.content_hash);
        }
    }

    #[test]
    fn test_chunk_ids_differ_across_documents() {
        let text = "The same text in two documents.";
        let a = chunk_text("doc1", text, 1000, 120);
        let b = chunk_text("doc2", text, 1000, 120);
        assert_ne!(a[0].chunk_id, b[0].chunk_id);
    }

    #[test]
    fn test_multibyte_text_respects_char_boundaries() {
        let text = "héllo wörld ".repeat(100);
        let chunks = chunk_text("doc1", &text, 64, 16);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            // Would panic inside chunk_text if a boundary were violated;
            // re-slice to be explicit.
            assert!(!chunk.chunk_text.is_empty());
        }
    }
}
