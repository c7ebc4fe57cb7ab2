//! In-memory inverted index with Okapi BM25 scoring.
//!
//! Not thread-safe by itself (per the spec); `MemoryService` and `HybridSearch`
//! guard access with a `parking_lot::RwLock` so concurrent reads are allowed
//! while writes are exclusive.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::tokenizer::tokenize;

const K1: f32 = 1.2;
const B: f32 = 0.75;

#[derive(Default)]
struct Postings {
    /// doc id -> term frequency within that doc
    docs: HashMap<Uuid, u32>,
}

/// In-process inverted index over `MemoryUnit` content, scored with Okapi BM25.
#[derive(Default)]
pub struct BM25Index {
    postings: HashMap<String, Postings>,
    doc_lengths: HashMap<Uuid, u32>,
    total_length: u64,
}

impl BM25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    fn avg_doc_length(&self) -> f32 {
        if self.doc_lengths.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.doc_lengths.len() as f32
        }
    }

    /// Index (or re-index) `content` under `id`. Removes any prior entry first.
    pub fn add(&mut self, id: Uuid, content: &str) {
        self.remove(id);

        let terms = tokenize(content);
        if terms.is_empty() {
            // Still record a zero-length doc so count/average bookkeeping is correct.
            self.doc_lengths.insert(id, 0);
            return;
        }

        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for term in &terms {
            *term_freq.entry(term.clone()).or_insert(0) += 1;
        }

        for (term, freq) in term_freq {
            self.postings
                .entry(term)
                .or_default()
                .docs
                .insert(id, freq);
        }

        self.doc_lengths.insert(id, terms.len() as u32);
        self.total_length += terms.len() as u64;
    }

    /// Drop every indexed document, resetting to an empty index.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.doc_lengths.clear();
        self.total_length = 0;
    }

    /// Remove all postings and the length entry for `id`, if present.
    pub fn remove(&mut self, id: Uuid) {
        if let Some(len) = self.doc_lengths.remove(&id) {
            self.total_length = self.total_length.saturating_sub(len as u64);
            for postings in self.postings.values_mut() {
                postings.docs.remove(&id);
            }
            self.postings.retain(|_, p| !p.docs.is_empty());
        }
    }

    /// Top-`k` `(id, score)` pairs for `query`, ranked by Okapi BM25.
    /// Ties break on ascending id for determinism.
    pub fn search(&self, query: &str, k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 || self.doc_lengths.is_empty() {
            return Vec::new();
        }

        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.doc_lengths.len() as f32;
        let avg_len = self.avg_doc_length();
        let mut scores: HashMap<Uuid, f32> = HashMap::new();

        for term in &query_terms {
            let Some(postings) = self.postings.get(term) else {
                continue;
            };
            let n_term = postings.docs.len() as f32;
            let idf = ((n - n_term + 0.5) / (n_term + 0.5) + 1.0).ln();

            for (&doc_id, &tf) in &postings.docs {
                let doc_len = *self.doc_lengths.get(&doc_id).unwrap_or(&0) as f32;
                let denom = tf as f32 + K1 * (1.0 - B + B * doc_len / avg_len.max(1e-6));
                let contribution = idf * (tf as f32 * (K1 + 1.0)) / denom;
                *scores.entry(doc_id).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<(Uuid, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked
    }
}
