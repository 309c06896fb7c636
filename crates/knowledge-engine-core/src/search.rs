//! Hybrid ranker combining BM25 and vector similarity.
//!
//! The core search algorithm operates entirely through the [`Store`] trait.
//! The calling application is responsible for embedding the query with the
//! active provider and passing its descriptor, so stale vectors can be
//! excluded.
//!
//! # Hybrid Scoring Algorithm
//!
//! 1. Fetch every keyword candidate (chunks with a positive BM25 score),
//!    unless `semantic_weight == 1`.
//! 2. Fetch every vector candidate produced by the active provider,
//!    unless `semantic_weight == 0`.
//! 3. Normalize both sets to `[0, 1]` using min-max normalization; a set
//!    whose scores are all equal normalizes to `1.0`.
//! 4. Merge: `combined = w × semantic + (1 - w) × lexical`, a missing
//!    score counts as `0.0`.
//! 5. Sort by combined score (desc), document `created_at` (desc), chunk
//!    id (asc).
//! 6. Truncate to `limit`.
//!
//! With `semantic_weight == 0` the order is the BM25 order. Chunks with
//! equal BM25 scores follow step 5 (newer document first), not the chunk
//! id order [`LexicalIndex::search`](crate::lexical::LexicalIndex::search)
//! uses for its own ties.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::lexical::tokenize;
use crate::models::{ProviderDescriptor, SearchResult};
use crate::store::{ChunkCandidate, Store};

/// Characters of chunk text shown in `highlighted_text`.
pub const EXCERPT_CHARS: usize = 240;

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// Query embedding from `active`, required when `semantic_weight > 0`.
    pub query_vec: Option<&'a [f32]>,
    /// Provider whose vectors are eligible for semantic ranking.
    pub active: &'a ProviderDescriptor,
    /// Weight of the semantic score, in `[0, 1]`.
    pub semantic_weight: f64,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Vectors skipped because they came from another provider, plus
    /// chunks with no vector at all.
    pub stale_excluded: usize,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
}

/// Run a hybrid search against a [`Store`] backend.
///
/// # Errors
///
/// - [`EngineError::InvalidInput`] for a weight outside `[0, 1]` or a
///   missing query vector when the semantic side is needed.
/// - [`EngineError::DimensionMismatch`] from the vector index.
/// - [`EngineError::IndexConsistency`] when an index returns a chunk the
///   store has no record of.
pub async fn search<S: Store + ?Sized>(store: &S, req: &SearchRequest<'_>) -> Result<SearchOutcome> {
    let w = req.semantic_weight;
    if !(0.0..=1.0).contains(&w) {
        return Err(EngineError::InvalidInput(format!(
            "semantic_weight must be within [0, 1], got {w}"
        )));
    }
    if req.query.trim().is_empty() || req.limit == 0 {
        return Ok(SearchOutcome::default());
    }

    let lexical = if w < 1.0 {
        store.keyword_search(req.query, usize::MAX).await?
    } else {
        Vec::new()
    };

    let (semantic, stale_excluded) = if w > 0.0 {
        let Some(qv) = req.query_vec else {
            return Err(EngineError::InvalidInput(
                "query vector is required when semantic_weight > 0".to_string(),
            ));
        };
        let found = store.vector_search(qv, usize::MAX, req.active).await?;
        (found.candidates, found.stale_excluded)
    } else {
        (Vec::new(), 0)
    };

    let lex_map: HashMap<&str, f64> = normalize_scores(&lexical)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let sem_map: HashMap<&str, f64> = normalize_scores(&semantic)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut ids: Vec<String> = Vec::with_capacity(lex_map.len() + sem_map.len());
    let mut seen: HashSet<&str> = HashSet::new();
    for c in lexical.iter().chain(semantic.iter()) {
        if seen.insert(c.chunk_id.as_str()) {
            ids.push(c.chunk_id.clone());
        }
    }

    let contexts = store.chunk_contexts(&ids).await?;
    if contexts.len() != ids.len() {
        let known: HashSet<&str> = contexts.iter().map(|c| c.chunk_id.as_str()).collect();
        let missing = ids
            .iter()
            .find(|id| !known.contains(id.as_str()))
            .cloned()
            .unwrap_or_default();
        return Err(EngineError::IndexConsistency(format!(
            "index returned chunk {missing} with no stored record"
        )));
    }

    let terms: HashSet<String> = tokenize(req.query).into_iter().collect();
    let mut results: Vec<SearchResult> = contexts
        .into_iter()
        .map(|ctx| {
            let semantic_score = sem_map.get(ctx.chunk_id.as_str()).copied().unwrap_or(0.0);
            let lexical_score = lex_map.get(ctx.chunk_id.as_str()).copied().unwrap_or(0.0);
            SearchResult {
                combined_score: combine(w, semantic_score, lexical_score),
                highlighted_text: highlight(&ctx.text, &terms),
                chunk_id: ctx.chunk_id,
                document_id: ctx.document_id,
                title: ctx.title,
                source_path: ctx.source_path,
                sequence_index: ctx.sequence_index,
                semantic_score,
                lexical_score,
                created_at: ctx.created_at,
                text: ctx.text,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(req.limit);

    debug!(
        lexical = lexical.len(),
        semantic = semantic.len(),
        stale_excluded,
        returned = results.len(),
        "hybrid search"
    );

    Ok(SearchOutcome {
        results,
        stale_excluded,
        lexical_candidates: lexical.len(),
        semantic_candidates: semantic.len(),
    })
}

/// `w × semantic + (1 - w) × lexical`.
pub fn combine(semantic_weight: f64, semantic: f64, lexical: f64) -> f64 {
    semantic_weight * semantic + (1.0 - semantic_weight) * lexical
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Excerpt of `text` around the first query term, with every query term
/// wrapped in `**`.
pub fn highlight(text: &str, terms: &HashSet<String>) -> String {
    let chars: Vec<char> = text.chars().collect();
    let first = first_term_position(&chars, terms).unwrap_or(0);
    let start = first.saturating_sub(EXCERPT_CHARS / 4);
    let end = (start + EXCERPT_CHARS).min(chars.len());

    let mut out = String::with_capacity(EXCERPT_CHARS + 16);
    if start > 0 {
        out.push_str("...");
    }
    let mut word = String::new();
    for &c in &chars[start..end] {
        if c.is_alphanumeric() {
            word.push(c);
        } else {
            flush_word(&mut out, &mut word, terms);
            out.push(c);
        }
    }
    flush_word(&mut out, &mut word, terms);
    if end < chars.len() {
        out.push_str("...");
    }
    out
}

fn flush_word(out: &mut String, word: &mut String, terms: &HashSet<String>) {
    if word.is_empty() {
        return;
    }
    if terms.contains(&word.to_lowercase()) {
        out.push_str("**");
        out.push_str(word);
        out.push_str("**");
    } else {
        out.push_str(word);
    }
    word.clear();
}

fn first_term_position(chars: &[char], terms: &HashSet<String>) -> Option<usize> {
    if terms.is_empty() {
        return None;
    }
    let mut i = 0;
    while i < chars.len() {
        if !chars[i].is_alphanumeric() {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && chars[i].is_alphanumeric() {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        if terms.contains(&word.to_lowercase()) {
            return Some(start);
        }
    }
    None
}
