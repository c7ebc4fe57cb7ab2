//! Context-window optimizer: HyDE-style query expansion, long-context
//! reordering, and token-budget trimming, composed as `HyDE -> MMR ->
//! budget-trim -> reorder`.

use crate::embedding::EmbeddingProvider;
use crate::error::MemoryResult;
use crate::search::maximal_marginal_relevance;
use crate::types::MemorySearchResult;
use crate::vector_math;

/// Which optimization passes ran, and the token counts before/after trimming.
#[derive(Debug, Clone, Default)]
pub struct OptimizationReport {
    pub hyde_applied: bool,
    pub mmr_applied: bool,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub dropped: usize,
}

/// Deterministic heuristic query expander: the contract is only that an
/// "enhanced" embedding is returned, not that it is semantically richer than
/// a true LLM-generated hypothetical document.
pub trait QueryExpander: Send + Sync {
    fn hypothetical_answer(&self, query: &str) -> String;
}

/// Synthesizes a longer hypothetical-answer string keyed on the query's lead
/// interrogative word, per the HyDE placeholder contract.
#[derive(Default)]
pub struct HeuristicQueryExpander;

impl QueryExpander for HeuristicQueryExpander {
    fn hypothetical_answer(&self, query: &str) -> String {
        let lead = query
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        let body = match lead.as_str() {
            "how" => "A step-by-step explanation describing the process, tools, and prerequisites involved",
            "what" => "A definition describing the concept, its properties, and typical examples",
            "why" => "A causal explanation describing the reasons, motivations, and consequences",
            "when" => "A temporal description naming the relevant dates, sequence, or conditions",
            "who" => "A description identifying the relevant people, roles, or organizations involved",
            "where" => "A description identifying the relevant location, system, or context",
            _ => "A detailed explanation addressing the query with supporting facts and context",
        };
        format!("{query}. {body}.")
    }
}

/// Approximate token count: `ceil(1.3 * whitespace_word_count)`.
pub fn approx_token_count(text: &str) -> usize {
    let words = text.split_whitespace().count();
    ((words as f32) * 1.3).ceil() as usize
}

/// Stable bias toward placing the most-important items at the head and tail
/// of the output: sort by score descending, distribute alternately into two
/// lists, concatenate `head ++ reverse(tail)`.
pub fn long_context_reorder(mut results: Vec<MemorySearchResult>) -> Vec<MemorySearchResult> {
    results.sort_by(|a, b| {
        b.unit
            .importance
            .partial_cmp(&a.unit.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut head = Vec::with_capacity(results.len().div_ceil(2));
    let mut tail = Vec::with_capacity(results.len() / 2);
    for (i, r) in results.into_iter().enumerate() {
        if i % 2 == 0 {
            head.push(r);
        } else {
            tail.push(r);
        }
    }
    tail.reverse();
    head.extend(tail);
    head
}

/// Greedily admit units (highest importance first) until the next one would
/// exceed `token_budget`. Returns the admitted subset and how many tokens
/// were dropped.
pub fn trim_to_token_budget(
    mut results: Vec<MemorySearchResult>,
    token_budget: usize,
) -> (Vec<MemorySearchResult>, usize) {
    results.sort_by(|a, b| {
        b.unit
            .importance
            .partial_cmp(&a.unit.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut admitted = Vec::new();
    let mut used = 0usize;
    let mut dropped = 0usize;
    for r in results {
        let cost = approx_token_count(&r.unit.content);
        if used + cost > token_budget {
            dropped += 1;
            continue;
        }
        used += cost;
        admitted.push(r);
    }
    (admitted, dropped)
}

/// Orchestrates the four optimization passes. `query_embedding` is optional;
/// when present and `use_hyde` is set, it is blended with the hypothetical
/// answer's embedding via `expander`/`provider`.
pub struct ContextOptimizer<E: QueryExpander> {
    expander: E,
}

impl<E: QueryExpander> ContextOptimizer<E> {
    pub fn new(expander: E) -> Self {
        Self { expander }
    }

    /// Produce an enhanced query embedding by averaging the original query
    /// embedding with the embedding of a synthesized hypothetical answer.
    pub async fn expand_query(
        &self,
        query: &str,
        query_embedding: &[f32],
        provider: &dyn EmbeddingProvider,
    ) -> MemoryResult<Vec<f32>> {
        let hypothetical = self.expander.hypothetical_answer(query);
        let hypothetical_embedding = provider.embed(&hypothetical).await?;
        let averaged = vector_math::average(&[query_embedding.to_vec(), hypothetical_embedding])?;
        Ok(vector_math::normalize(&averaged))
    }

    /// Compose MMR, token-budget trimming, and long-context reordering over
    /// `results`. HyDE expansion happens upstream (it mutates the query
    /// embedding used to produce `results`, not the results themselves).
    pub fn optimize(
        &self,
        results: Vec<MemorySearchResult>,
        query_embedding: Option<&[f32]>,
        use_mmr: bool,
        mmr_lambda: f32,
        limit: usize,
        token_budget: Option<usize>,
        hyde_applied: bool,
    ) -> (Vec<MemorySearchResult>, OptimizationReport) {
        let tokens_before: usize = results.iter().map(|r| approx_token_count(&r.unit.content)).sum();

        let mut working = if use_mmr {
            maximal_marginal_relevance(results, query_embedding, mmr_lambda, limit)
        } else {
            let mut r = results;
            r.truncate(limit);
            r
        };

        let mut dropped = 0;
        if let Some(budget) = token_budget {
            let (trimmed, d) = trim_to_token_budget(working, budget);
            working = trimmed;
            dropped = d;
        }

        let tokens_after = working.iter().map(|r| approx_token_count(&r.unit.content)).sum();
        let reordered = long_context_reorder(working);

        let report = OptimizationReport {
            hyde_applied,
            mmr_applied: use_mmr,
            tokens_before,
            tokens_after,
            dropped,
        };
        (reordered, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MemoryType, MemoryUnit, ResultSource};

    fn result(content: &str, importance: f32, score: f32) -> MemorySearchResult {
        let mut unit = MemoryUnit::new("o", content, MemoryType::Fact);
        unit.importance = importance;
        MemorySearchResult::new(unit, score, ResultSource::Hybrid)
    }

    #[test]
    fn token_count_matches_formula() {
        assert_eq!(approx_token_count("one two three four"), 6); // ceil(4*1.3)=6
        assert_eq!(approx_token_count(""), 0);
    }

    #[test]
    fn long_context_reorder_places_top_items_at_edges() {
        let results = vec![
            result("a", 0.9, 0.9),
            result("b", 0.8, 0.8),
            result("c", 0.7, 0.7),
            result("d", 0.6, 0.6),
        ];
        let reordered = long_context_reorder(results);
        // Highest importance goes to head[0]; second-highest goes to tail, which
        // gets reversed and appended last overall among the distributed set.
        assert_eq!(reordered.first().unwrap().unit.content, "a");
    }

    #[test]
    fn long_context_reorder_sorts_by_importance_not_score() {
        let results = vec![
            result("low-importance-high-score", 0.1, 0.9),
            result("high-importance-low-score", 0.9, 0.1),
        ];
        let reordered = long_context_reorder(results);
        assert_eq!(reordered.first().unwrap().unit.content, "high-importance-low-score");
    }

    #[test]
    fn token_budget_trim_drops_low_importance_first() {
        let results = vec![
            result("word ".repeat(20).trim(), 0.9, 0.9),
            result("word ".repeat(20).trim(), 0.1, 0.5),
        ];
        let (admitted, dropped) = trim_to_token_budget(results, 30);
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].unit.importance, 0.9);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn hyde_expander_varies_by_lead_word() {
        let expander = HeuristicQueryExpander;
        let how = expander.hypothetical_answer("How do I configure retries?");
        let what = expander.hypothetical_answer("What is a retry budget?");
        assert_ne!(how, what);
        assert!(how.starts_with("How"));
    }
}
