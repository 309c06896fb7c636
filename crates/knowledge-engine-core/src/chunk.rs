//! Overlapping-window text chunker.
//!
//! Splits normalized document text into [`Chunk`]s of at most
//! `chunk_size` tokens whose character spans overlap by `overlap` tokens,
//! so text that straddles a window boundary is retrievable from either
//! side.
//!
//! Each chunk receives a deterministic UUID derived from its document ID
//! and sequence index, plus a SHA-256 hash of its text. Re-chunking
//! byte-identical input with identical parameters yields identical ids and
//! hashes, which is what lets the ingestion pipeline skip re-embedding
//! unchanged chunks.
//!
//! # Algorithm
//!
//! 1. Convert token budgets to characters using a 4 chars/token ratio.
//! 2. Open a window of `chunk_size` characters at the current start.
//! 3. Unless the window reaches the end of the text, snap its end back to
//!    the best break point within the last 20% of the window: paragraph
//!    break, sentence end, clause break, whitespace, else the hard limit.
//! 4. Emit the window and move the start to `end - overlap`.
//! 5. Empty or whitespace-only text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use knowledge_engine_core::chunk::{chunk_text, ChunkParams};
//!
//! let params = ChunkParams::new(512, 50).unwrap();
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", &params);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].sequence_index, 0);
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{CharSpan, Chunk};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Window size and overlap, both in tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkParams {
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] if `chunk_size` is zero or
    /// `overlap` is not smaller than `chunk_size`.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(EngineError::Configuration(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if overlap >= chunk_size {
            return Err(EngineError::Configuration(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    fn size_chars(&self) -> usize {
        self.chunk_size * CHARS_PER_TOKEN
    }

    fn overlap_chars(&self) -> usize {
        self.overlap * CHARS_PER_TOKEN
    }
}

/// Split text into overlapping chunks.
///
/// # Guarantees
///
/// - Sequence indices are contiguous: `0, 1, 2, …, N-1`.
/// - Text no longer than one window yields exactly one chunk.
/// - Empty or whitespace-only text yields zero chunks.
/// - `text` of every chunk equals the characters covered by its `char_span`.
pub fn chunk_text(document_id: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total = chars.len();
    let size = params.size_chars();
    let overlap = params.overlap_chars();

    let mut chunks = Vec::new();
    let mut start = 0;

    loop {
        let mut end = (start + size).min(total);
        if end < total {
            end = find_break_point(&chars, start, end, size);
        }

        let piece = &text[offsets[start]..offsets[end]];
        if !piece.trim().is_empty() {
            let index = chunks.len();
            chunks.push(make_chunk(document_id, index, piece, CharSpan { start, end }));
        }

        if end >= total {
            break;
        }

        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

#[derive(Clone, Copy)]
enum Break {
    Paragraph,
    Sentence,
    Clause,
    Whitespace,
}

impl Break {
    fn matches(self, chars: &[char], i: usize) -> bool {
        match self {
            Break::Paragraph => i >= 2 && chars[i - 1] == '\n' && chars[i - 2] == '\n',
            Break::Sentence => {
                i >= 2 && chars[i - 1].is_whitespace() && matches!(chars[i - 2], '.' | '!' | '?')
            }
            Break::Clause => {
                i >= 2 && chars[i - 1].is_whitespace() && matches!(chars[i - 2], ',' | ';' | ':')
            }
            Break::Whitespace => i >= 1 && chars[i - 1].is_whitespace(),
        }
    }
}

/// Find the exclusive end of a window, searching back from `end`.
///
/// Always returns a value in `(start, end]`.
fn find_break_point(chars: &[char], start: usize, end: usize, size: usize) -> usize {
    let window_start = end.saturating_sub(size / 5).max(start + 1);
    for kind in [
        Break::Paragraph,
        Break::Sentence,
        Break::Clause,
        Break::Whitespace,
    ] {
        if let Some(i) = (window_start..=end).rev().find(|&i| kind.matches(chars, i)) {
            return i;
        }
    }
    end
}

/// Clean extracted text before chunking.
///
/// Drops control characters (keeping newlines), turns tabs into spaces,
/// collapses runs of spaces to one and runs of 3+ newlines to a paragraph
/// break, and trims both ends.
pub fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0usize;
    let mut pending_space = false;

    for c in text.chars() {
        let c = if c == '\t' { ' ' } else { c };
        if c == '\n' {
            newlines += 1;
            continue;
        }
        if c == ' ' {
            pending_space = true;
            continue;
        }
        if c.is_control() {
            continue;
        }
        if !out.is_empty() {
            if newlines > 0 {
                for _ in 0..newlines.min(2) {
                    out.push('\n');
                }
            } else if pending_space {
                out.push(' ');
            }
        }
        newlines = 0;
        pending_space = false;
        out.push(c);
    }

    out
}

/// Hex SHA-256 of a byte string.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Deterministic chunk id for `(document_id, sequence_index)`.
pub fn chunk_id(document_id: &str, sequence_index: usize) -> String {
    let name = format!("{document_id}#{sequence_index}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn make_chunk(document_id: &str, index: usize, text: &str, span: CharSpan) -> Chunk {
    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        sequence_index: index,
        text: text.to_string(),
        char_span: span,
        hash: content_hash(text.as_bytes()),
        embedding: None,
        embedding_provider_id: None,
        embedding_dimension: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(size, overlap).unwrap()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", &params(512, 50));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].sequence_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].char_span, CharSpan { start: 0, end: 13 });
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("doc1", "", &params(512, 50)).is_empty());
        assert!(chunk_text("doc1", "  \n\n \t", &params(512, 50)).is_empty());
    }

    #[test]
    fn test_invalid_params() {
        assert!(ChunkParams::new(0, 0).is_err());
        assert!(ChunkParams::new(10, 10).is_err());
        assert!(ChunkParams::new(10, 9).is_ok());
    }

    #[test]
    fn test_windows_overlap_by_overlap_chars() {
        let text = "word ".repeat(1000);
        let chunks = chunk_text("doc1", &text, &params(50, 10));
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].char_span.start + 40, pair[0].char_span.end);
        }
        for c in &chunks {
            assert!(c.char_span.len() <= 200);
        }
    }

    #[test]
    fn test_text_matches_span() {
        let text = (0..200)
            .map(|i| format!("Sentence number {i} talks about things."))
            .collect::<Vec<_>>()
            .join(" ");
        let chars: Vec<char> = text.chars().collect();
        for c in chunk_text("doc1", &text, &params(30, 5)) {
            let expected: String = chars[c.char_span.start..c.char_span.end].iter().collect();
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn test_breaks_at_sentence_end() {
        let text = format!("{}. {}", "a".repeat(170), "b".repeat(300));
        let chunks = chunk_text("doc1", &text, &params(50, 5));
        assert!(chunks[0].text.ends_with(". "));
    }

    #[test]
    fn test_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, &params(10, 2));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘".repeat(20);
        let chunks = chunk_text("doc1", &text, &params(5, 1));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(!c.text.trim().is_empty());
        }
    }

    #[test]
    fn test_deterministic_ids() {
        let text = "Alpha beta gamma delta. ".repeat(100);
        let a: HashSet<String> = chunk_text("doc1", &text, &params(20, 4))
            .into_iter()
            .map(|c| c.id)
            .collect();
        let b: HashSet<String> = chunk_text("doc1", &text, &params(20, 4))
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(a, b);

        let c1 = chunk_text("doc1", &text, &params(20, 4));
        let c2 = chunk_text("doc1", &text, &params(20, 4));
        for (x, y) in c1.iter().zip(c2.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn test_ids_differ_across_documents() {
        assert_ne!(chunk_id("doc1", 0), chunk_id("doc2", 0));
        assert_ne!(chunk_id("doc1", 0), chunk_id("doc1", 1));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  a\t\tb  "), "a b");
        assert_eq!(normalize_text("a\n\n\n\nb"), "a\n\nb");
        assert_eq!(normalize_text("a\u{0}b\u{7}c"), "abc");
        assert_eq!(normalize_text("line  \n  next"), "line\nnext");
        assert_eq!(normalize_text("\n\n  "), "");
    }
}
