//! In-memory BM25 keyword index over chunk text.
//!
//! Terms come from [`tokenize`]: lowercase, split on anything that is not
//! alphanumeric. Scores use Okapi BM25 with `k1 = 1.5`, `b = 0.75` and the
//! non-negative idf variant `ln(1 + (N - df + 0.5) / (df + 0.5))`, so a
//! term that appears in every chunk still contributes a small positive
//! score instead of a negative one.
//!
//! Postings are updated incrementally on [`LexicalIndex::upsert`] and
//! [`LexicalIndex::remove`]; the corpus is never rebuilt from scratch.

use std::collections::{HashMap, HashSet};

pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;

/// Split text into lowercase alphanumeric terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[derive(Debug, Default)]
struct TermStats {
    tf: HashMap<String, u32>,
    len: usize,
}

#[derive(Debug, Default)]
pub struct LexicalIndex {
    chunks: HashMap<String, TermStats>,
    postings: HashMap<String, HashSet<String>>,
    total_len: usize,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `text` under `chunk_id`, replacing any previous entry.
    pub fn upsert(&mut self, chunk_id: &str, text: &str) {
        self.remove(chunk_id);

        let terms = tokenize(text);
        let mut stats = TermStats {
            tf: HashMap::new(),
            len: terms.len(),
        };
        for term in terms {
            *stats.tf.entry(term).or_insert(0) += 1;
        }
        for term in stats.tf.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(chunk_id.to_string());
        }
        self.total_len += stats.len;
        self.chunks.insert(chunk_id.to_string(), stats);
    }

    /// Drop `chunk_id`. Returns false if it was not indexed.
    pub fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(stats) = self.chunks.remove(chunk_id) else {
            return false;
        };
        self.total_len -= stats.len;
        for term in stats.tf.keys() {
            if let Some(ids) = self.postings.get_mut(term) {
                ids.remove(chunk_id);
                if ids.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &String> {
        self.chunks.keys()
    }

    pub fn avg_len(&self) -> f64 {
        if self.chunks.is_empty() {
            0.0
        } else {
            self.total_len as f64 / self.chunks.len() as f64
        }
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, HashSet::len)
    }

    fn idf(&self, df: usize) -> f64 {
        let n = self.chunks.len() as f64;
        let df = df as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Score every chunk containing at least one query term.
    ///
    /// Returns `(chunk_id, score)` pairs, best first, ties broken by
    /// chunk id, truncated to `limit`.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let avg_len = self.avg_len();
        let mut scores: HashMap<&str, f64> = HashMap::new();

        for term in &terms {
            let Some(ids) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(ids.len());
            for id in ids {
                let Some(stats) = self.chunks.get(id) else {
                    continue;
                };
                let tf = f64::from(stats.tf.get(term).copied().unwrap_or(0));
                let norm = if avg_len > 0.0 {
                    stats.len as f64 / avg_len
                } else {
                    1.0
                };
                let score = idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * norm));
                *scores.entry(id.as_str()).or_insert(0.0) += score;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }
}
