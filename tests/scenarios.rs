//! End-to-end scenarios (S1-S6) and the property-test invariants, run
//! against the in-memory store and the deterministic hashing embedding
//! provider.

use std::sync::Arc;

use mnemo_core::config::{MemoryCoreConfig, ScoringConfig};
use mnemo_core::context::HeuristicQueryExpander;
use mnemo_core::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use mnemo_core::error::MemoryError;
use mnemo_core::store::memory_backend::InMemoryStore;
use mnemo_core::store::MemoryStore;
use mnemo_core::{DuplicatePolicy, MemoryFilter, MemoryService, MemoryType, MergeStrategy};

type Svc = MemoryService<InMemoryStore, HashingEmbeddingProvider, HeuristicQueryExpander>;

async fn make_service(config: MemoryCoreConfig) -> Svc {
    MemoryService::new(
        Arc::new(InMemoryStore::new(64)),
        Arc::new(HashingEmbeddingProvider::new(64)),
        HeuristicQueryExpander,
        config,
    )
    .await
    .unwrap()
}

// S1 - exact duplicate skip.
#[tokio::test]
async fn s1_exact_duplicate_skip() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    let content = "The capital of France is Paris.";

    let first = svc
        .remember_with_policy("u", content, MemoryType::Fact, DuplicatePolicy::Skip)
        .await
        .unwrap();
    let err = svc
        .remember_with_policy("u", content, MemoryType::Fact, DuplicatePolicy::Skip)
        .await
        .unwrap_err();

    assert!(matches!(err, MemoryError::Conflict { existing_id } if existing_id == first.unit().id));
    assert_eq!(svc.count_for_owner("u").await.unwrap(), 1);
}

// S2 - hybrid beats dense alone.
#[tokio::test]
async fn s2_hybrid_favors_lexical_match() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    svc.remember("u", "React + Node + Mongo", MemoryType::Fact).await.unwrap();
    svc.remember("u", "Python + Django + Postgres", MemoryType::Fact).await.unwrap();
    svc.remember("u", "Go + Kafka + Redis", MemoryType::Fact).await.unwrap();

    let outcome = svc
        .recall("Node.js stack", MemoryFilter::for_owner("u"), 3, None)
        .await
        .unwrap();

    assert!(!outcome.results.is_empty());
    assert!(outcome.results[0].unit.content.contains("Node"));
}

// S3 - soft delete hidden by default, visible with include_deleted.
#[tokio::test]
async fn s3_soft_delete_hidden_by_default() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    let outcome = svc.remember("u", "a fact worth remembering", MemoryType::Fact).await.unwrap();
    let id = outcome.unit().id;

    svc.delete(id, false).await.unwrap();

    let visible = svc
        .recall("fact worth remembering", MemoryFilter::for_owner("u"), 5, None)
        .await
        .unwrap();
    assert!(!visible.results.iter().any(|r| r.unit.id == id));

    let mut filter = MemoryFilter::for_owner("u");
    filter.include_deleted = true;
    let all = svc.list(&filter).await.unwrap();
    assert!(all.iter().any(|u| u.id == id));
}

// S4 - dimension mismatch is fatal, and rejected before it ever reaches storage.
#[tokio::test]
async fn s4_dimension_mismatch_is_an_error() {
    use mnemo_core::types::MemoryUnit;

    let store = InMemoryStore::new(64);
    let mut unit = MemoryUnit::new("u", "wrong size vector", MemoryType::Fact);
    unit.embedding = Some(vec![0.0; 16]);
    let id = unit.id;

    let err = store.insert(unit).await.unwrap_err();
    assert!(matches!(err, MemoryError::Shape { expected: 64, actual: 16 }));
    assert!(store.get(id).await.unwrap().is_none());
}

// S5 - MMR diversity.
#[tokio::test]
async fn s5_mmr_includes_distinct_unit() {
    let mut config = MemoryCoreConfig::default();
    config.search.use_mmr = true;
    config.search.mmr_lambda = 0.3;
    let svc = make_service(config).await;

    for i in 0..5 {
        svc.remember("u", format!("the quarterly revenue report number {i}"), MemoryType::Fact)
            .await
            .unwrap();
    }
    svc.remember("u", "a completely unrelated note about gardening", MemoryType::Fact)
        .await
        .unwrap();

    let outcome = svc
        .recall("quarterly revenue report", MemoryFilter::for_owner("u"), 3, None)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results.iter().any(|r| r.unit.content.contains("gardening")));
}

// S6 - recency decay.
#[tokio::test]
async fn s6_recency_decay_matches_formula() {
    use chrono::{Duration, Utc};
    use mnemo_core::scoring::ScoringService;
    use mnemo_core::types::MemoryUnit;

    let scoring = ScoringService::new(ScoringConfig::default());
    let mut fresh = MemoryUnit::new("u", "same content", MemoryType::Fact);
    let mut stale = fresh.clone();
    stale.id = uuid::Uuid::new_v4();

    let now = Utc::now();
    fresh.last_accessed_at = Some(now);
    stale.last_accessed_at = Some(now - Duration::hours(720));

    let fresh_score = scoring.score(&fresh, None, now);
    let stale_score = scoring.score(&stale, None, now);

    let alpha = ScoringConfig::default().alpha;
    let expected_gap = alpha * (1.0 - 0.995f32.powf(720.0));
    let actual_gap = fresh_score.combined - stale_score.combined;

    assert!((actual_gap - expected_gap).abs() < 1e-3);
    assert!(fresh_score.combined > stale_score.combined);
}

// Property 2: recall never returns more than k results, and every result
// satisfies the structural filter.
#[tokio::test]
async fn property_recall_respects_limit_and_filter() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    for i in 0..10 {
        svc.remember("u", format!("memory entry number {i}"), MemoryType::Fact)
            .await
            .unwrap();
    }
    let outcome = svc
        .recall("memory entry", MemoryFilter::for_owner("u"), 4, None)
        .await
        .unwrap();
    assert!(outcome.results.len() <= 4);
    assert!(outcome.results.iter().all(|r| r.unit.owner == "u"));
}

// Property 3: CombineContent idempotence yields one row with summed counts.
#[tokio::test]
async fn property_combine_content_idempotence() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    svc.remember_with_policy(
        "u",
        "idempotent fact",
        MemoryType::Fact,
        DuplicatePolicy::Merge(MergeStrategy::CombineContent),
    )
    .await
    .unwrap();
    svc.remember_with_policy(
        "u",
        "idempotent fact",
        MemoryType::Fact,
        DuplicatePolicy::Merge(MergeStrategy::CombineContent),
    )
    .await
    .unwrap();

    assert_eq!(svc.count_for_owner("u").await.unwrap(), 1);
}

// Property 6: hard delete -> NotFound; soft delete -> hidden by default, visible with include_deleted.
#[tokio::test]
async fn property_delete_semantics() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    let outcome = svc.remember("u", "to be deleted", MemoryType::Fact).await.unwrap();
    let id = outcome.unit().id;

    svc.delete(id, true).await.unwrap();
    assert!(svc.get(id).await.unwrap().is_none());
}

// Property 7: BM25 determinism across repeated searches over a fixed corpus.
#[tokio::test]
async fn property_bm25_search_is_deterministic() {
    let svc = make_service(MemoryCoreConfig::default()).await;
    svc.remember("u", "alpha beta gamma delta", MemoryType::Fact).await.unwrap();
    svc.remember("u", "alpha beta epsilon zeta", MemoryType::Fact).await.unwrap();

    let first = svc.recall("alpha beta", MemoryFilter::for_owner("u"), 5, None).await.unwrap();
    let second = svc.recall("alpha beta", MemoryFilter::for_owner("u"), 5, None).await.unwrap();

    let first_ids: Vec<_> = first.results.iter().map(|r| r.unit.id).collect();
    let second_ids: Vec<_> = second.results.iter().map(|r| r.unit.id).collect();
    assert_eq!(first_ids, second_ids);
}

struct FailingProvider;

#[async_trait::async_trait]
impl EmbeddingProvider for FailingProvider {
    async fn embed(&self, _text: &str) -> mnemo_core::error::MemoryResult<Vec<f32>> {
        Err(MemoryError::Upstream("embedding backend unreachable".to_string()))
    }

    fn dimensions(&self) -> usize {
        64
    }
}

// Embedding failure aborts the call with `Upstream`, leaving no partial state.
#[tokio::test]
async fn embedding_failure_surfaces_as_upstream_and_leaves_no_row() {
    let svc: MemoryService<InMemoryStore, FailingProvider, HeuristicQueryExpander> = MemoryService::new(
        Arc::new(InMemoryStore::new(64)),
        Arc::new(FailingProvider),
        HeuristicQueryExpander,
        MemoryCoreConfig::default(),
    )
    .await
    .unwrap();

    let err = svc.remember("u", "never gets stored", MemoryType::Fact).await.unwrap_err();
    assert!(matches!(err, MemoryError::Upstream(_)));
    assert_eq!(svc.count_for_owner("u").await.unwrap(), 0);

    let err = svc
        .recall("anything", MemoryFilter::for_owner("u"), 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Upstream(_)));
}
