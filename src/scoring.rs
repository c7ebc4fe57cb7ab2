//! Composite relevance scoring: `S(m,q) = αR + βI + γV + δF`.
//!
//! Grounded on the teacher's weighted-sum composite scorer, adapted to the
//! four factors named in the spec (recency, importance, vector relevance,
//! access frequency) instead of the teacher's own factor set.

use chrono::{DateTime, Utc};

use crate::config::ScoringConfig;
use crate::types::MemoryUnit;
use crate::vector_math;

/// Per-factor breakdown alongside the combined score, useful for debugging
/// and for the property tests that hold factors constant while varying one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub recency: f32,
    pub importance: f32,
    pub relevance: f32,
    pub frequency: f32,
    pub combined: f32,
}

/// Stateless scorer parameterized by `ScoringConfig`.
#[derive(Debug, Clone)]
pub struct ScoringService {
    weights: ScoringConfig,
}

impl ScoringService {
    pub fn new(weights: ScoringConfig) -> Self {
        Self { weights }
    }

    /// Exponential recency decay over hours since the unit was last touched.
    /// `decay` defaults to 0.995 so a week-old, untouched memory scores
    /// noticeably lower than a fresh one (see scenario S6).
    pub fn recency(&self, unit: &MemoryUnit, now: DateTime<Utc>) -> f32 {
        let delta_hours = unit.age_hours(now);
        self.weights.decay.powf(delta_hours)
    }

    /// Clamped importance, already expected to live in `[0, 1]` (invariant I6).
    pub fn importance(&self, unit: &MemoryUnit) -> f32 {
        unit.importance.clamp(0.0, 1.0)
    }

    /// Cosine similarity between the unit's embedding and the query embedding.
    /// `0.0` when either is absent, rather than an error: relevance is best-effort.
    pub fn relevance(&self, unit: &MemoryUnit, query_embedding: Option<&[f32]>) -> f32 {
        match (unit.embedding.as_deref(), query_embedding) {
            (Some(u), Some(q)) => vector_math::cosine(u, q).unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Log-scaled access frequency, clamped to `[0, 1]` against `expected_max`.
    pub fn frequency(&self, unit: &MemoryUnit) -> f32 {
        let expected_max = self.weights.expected_max.max(1.0);
        let value =
            (1.0 + unit.access_count as f32).ln() / (1.0 + expected_max).ln();
        value.clamp(0.0, 1.0)
    }

    /// Full weighted combination plus each constituent factor.
    pub fn score(
        &self,
        unit: &MemoryUnit,
        query_embedding: Option<&[f32]>,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let recency = self.recency(unit, now);
        let importance = self.importance(unit);
        let relevance = self.relevance(unit, query_embedding);
        let frequency = self.frequency(unit);
        let combined = self.weights.alpha * recency
            + self.weights.beta * importance
            + self.weights.gamma * relevance
            + self.weights.delta * frequency;
        ScoreBreakdown {
            recency,
            importance,
            relevance,
            frequency,
            combined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;
    use chrono::Duration;

    fn svc() -> ScoringService {
        ScoringService::new(ScoringConfig::default())
    }

    #[test]
    fn fresh_memory_has_recency_near_one() {
        let svc = svc();
        let unit = MemoryUnit::new("o", "content", MemoryType::Fact);
        let now = unit.created_at;
        assert!((svc.recency(&unit, now) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn recency_decays_with_age_per_scenario_s6() {
        let svc = svc();
        let unit = MemoryUnit::new("o", "content", MemoryType::Fact);
        let now = unit.created_at + Duration::hours(720);
        let decayed = svc.recency(&unit, now);
        let expected = 0.995f32.powf(720.0);
        assert!((decayed - expected).abs() < 1e-4);
        // Gap against a fresh memory should roughly match alpha * (1 - 0.995^720).
        let gap = svc.weights.alpha * (1.0 - expected);
        assert!(gap > 0.0);
    }

    #[test]
    fn frequency_is_monotone_in_access_count() {
        let svc = svc();
        let mut low = MemoryUnit::new("o", "c", MemoryType::Fact);
        low.access_count = 1;
        let mut high = low.clone();
        high.access_count = 50;
        assert!(svc.frequency(&high) > svc.frequency(&low));
    }

    #[test]
    fn frequency_is_bounded() {
        let svc = svc();
        let mut unit = MemoryUnit::new("o", "c", MemoryType::Fact);
        unit.access_count = 10_000_000;
        assert!(svc.frequency(&unit) <= 1.0);
    }

    #[test]
    fn relevance_without_embeddings_is_zero() {
        let svc = svc();
        let unit = MemoryUnit::new("o", "c", MemoryType::Fact);
        assert_eq!(svc.relevance(&unit, None), 0.0);
        assert_eq!(svc.relevance(&unit, Some(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn combined_score_is_monotone_in_importance_holding_others_fixed() {
        let svc = svc();
        let mut low = MemoryUnit::new("o", "c", MemoryType::Fact);
        low.importance = 0.1;
        let mut high = low.clone();
        high.importance = 0.9;
        let now = low.created_at;
        let s_low = svc.score(&low, None, now).combined;
        let s_high = svc.score(&high, None, now).combined;
        assert!(s_high > s_low);
    }
}
