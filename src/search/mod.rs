//! Hybrid retrieval: dense cosine search and BM25 sparse search fused by
//! Reciprocal Rank Fusion, with an optional MMR diversity pass.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use rayon::prelude::*;
use uuid::Uuid;

use crate::bm25::BM25Index;
use crate::config::SearchConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::store::MemoryStore;
use crate::types::{MemoryFilter, MemorySearchResult, MemoryUnit, ResultSource};
use crate::vector_math;

/// Query-time parameters for a single `HybridSearch::search` call.
pub struct SearchRequest<'a> {
    pub query_text: &'a str,
    pub query_embedding: Option<&'a [f32]>,
    pub filter: MemoryFilter,
    pub limit: usize,
}

/// Combines a dense vector scan with a sparse BM25 scan over the shared
/// inverted index, merging both rankings via RRF.
pub struct HybridSearch {
    config: SearchConfig,
}

impl HybridSearch {
    pub fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    /// Dense ranking: cosine similarity between `query_embedding` and each
    /// candidate's embedding, descending, ties broken by ascending id,
    /// truncated to `limit`. A shape mismatch is an invariant violation (the
    /// store rejects mismatched embeddings on write) and is propagated rather
    /// than silently dropping the offending candidate. The brute-force scan
    /// is embarrassingly parallel, so it runs across rayon's thread pool
    /// rather than a sequential scalar loop.
    fn dense_rank(
        &self,
        candidates: &[MemoryUnit],
        query_embedding: &[f32],
        limit: usize,
    ) -> MemoryResult<Vec<(Uuid, f32)>> {
        let scored: Vec<Option<(Uuid, f32)>> = candidates
            .par_iter()
            .map(|u| -> MemoryResult<Option<(Uuid, f32)>> {
                match u.embedding.as_deref() {
                    Some(emb) => vector_math::cosine(emb, query_embedding).map(|s| Some((u.id, s))),
                    None => Ok(None),
                }
            })
            .collect::<MemoryResult<Vec<_>>>()?;

        let mut ranked: Vec<(Uuid, f32)> = scored.into_iter().flatten().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Merge two rankings with Reciprocal Rank Fusion:
    /// `score(id) = dense_weight / (k + rank_dense) + sparse_weight / (k + rank_sparse)`.
    fn reciprocal_rank_fusion(
        &self,
        dense: &[(Uuid, f32)],
        sparse: &[(Uuid, f32)],
    ) -> HashMap<Uuid, f32> {
        let k = self.config.rrf_k;
        let mut fused: HashMap<Uuid, f32> = HashMap::new();

        for (rank, (id, _)) in dense.iter().enumerate() {
            let contribution = self.config.dense_weight / (k + rank as f32 + 1.0);
            *fused.entry(*id).or_insert(0.0) += contribution;
        }
        for (rank, (id, _)) in sparse.iter().enumerate() {
            let contribution = self.config.sparse_weight / (k + rank as f32 + 1.0);
            *fused.entry(*id).or_insert(0.0) += contribution;
        }
        fused
    }

    /// Run a hybrid search against `store`/`bm25` for `request`. The vector
    /// path (fetch candidates matching `request.filter`, rank by cosine) and
    /// the sparse path (BM25 lookup) run concurrently; ids surfaced only by
    /// the sparse path are hydrated from `store` and re-checked against the
    /// filter, since the BM25 index is not itself scoped to a filter.
    pub async fn search(
        &self,
        request: &SearchRequest<'_>,
        store: &dyn MemoryStore,
        bm25: &RwLock<BM25Index>,
    ) -> MemoryResult<Vec<MemorySearchResult>> {
        let fetch_limit = (request.limit * 3).max(request.limit);

        let dense_fut = async {
            let candidates = store.scan_for_vector_search(&request.filter).await?;
            let ranked = match request.query_embedding {
                Some(q) => self.dense_rank(&candidates, q, fetch_limit)?,
                None => Vec::new(),
            };
            Ok::<_, MemoryError>((ranked, candidates))
        };
        let sparse_fut = async {
            Ok::<_, MemoryError>(bm25.read().search(request.query_text, fetch_limit))
        };

        let ((dense, candidates), sparse) = tokio::try_join!(dense_fut, sparse_fut)?;

        let fused = self.reciprocal_rank_fusion(&dense, &sparse);
        let dense_ids: HashSet<Uuid> = dense.iter().map(|(id, _)| *id).collect();
        let sparse_ids: HashSet<Uuid> = sparse.iter().map(|(id, _)| *id).collect();
        let mut by_id: HashMap<Uuid, MemoryUnit> = candidates.into_iter().map(|u| (u.id, u)).collect();

        let mut results = Vec::with_capacity(fused.len());
        for (id, score) in fused {
            let unit = match by_id.remove(&id) {
                Some(u) => u,
                None => match store.get(id).await? {
                    Some(u) if request.filter.matches(&u) => u,
                    _ => continue,
                },
            };
            let source = match (dense_ids.contains(&id), sparse_ids.contains(&id)) {
                (true, true) => ResultSource::Hybrid,
                (true, false) => ResultSource::Dense,
                (false, true) => ResultSource::Sparse,
                (false, false) => ResultSource::Hybrid,
            };
            results.push(MemorySearchResult::new(unit, score, source));
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit.id.cmp(&b.unit.id))
        });
        results.retain(|r| r.score >= self.config.min_score);

        if self.config.use_mmr {
            results = maximal_marginal_relevance(
                results,
                request.query_embedding,
                self.config.mmr_lambda,
                request.limit,
            );
        } else {
            results.truncate(request.limit);
        }

        Ok(results)
    }
}

/// Greedy Maximal Marginal Relevance selection: iteratively picks the
/// candidate maximizing `lambda * relevance - (1 - lambda) * max_sim_to_selected`,
/// falling back to relevance-only order when embeddings are absent.
pub fn maximal_marginal_relevance(
    candidates: Vec<MemorySearchResult>,
    query_embedding: Option<&[f32]>,
    lambda: f32,
    limit: usize,
) -> Vec<MemorySearchResult> {
    if candidates.is_empty() || limit == 0 {
        return Vec::new();
    }
    let Some(_query_embedding) = query_embedding else {
        let mut sorted = candidates;
        sorted.truncate(limit);
        return sorted;
    };

    let n = candidates.len();
    let mut selected: Vec<usize> = Vec::with_capacity(limit.min(n));
    let mut remaining: Vec<usize> = (0..n).collect();

    remaining.sort_by(|&a, &b| {
        candidates[b]
            .score
            .partial_cmp(&candidates[a].score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let first = remaining.remove(0);
    selected.push(first);

    while !remaining.is_empty() && selected.len() < limit {
        let mut best_idx = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let relevance = candidates[idx].score;
            let max_sim = selected
                .iter()
                .filter_map(|&s| {
                    let a = candidates[idx].unit.embedding.as_deref()?;
                    let b = candidates[s].unit.embedding.as_deref()?;
                    vector_math::cosine(a, b).ok()
                })
                .fold(0.0f32, f32::max);
            let mmr = lambda * relevance - (1.0 - lambda) * max_sim;
            if mmr > best_score {
                best_score = mmr;
                best_idx = pos;
            }
        }
        selected.push(remaining.remove(best_idx));
    }

    let mut owned: Vec<Option<MemorySearchResult>> = candidates.into_iter().map(Some).collect();
    selected
        .into_iter()
        .filter_map(|i| owned[i].take())
        .collect()
}
