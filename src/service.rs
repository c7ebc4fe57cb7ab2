//! `MemoryService`: the orchestrator tying storage, embedding, BM25, scoring,
//! duplicate detection, search, and context optimization into the public API.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bm25::BM25Index;
use crate::config::MemoryCoreConfig;
use crate::context::{ContextOptimizer, OptimizationReport, QueryExpander};
use crate::duplicate::{DuplicateDetector, DuplicatePolicy, DuplicateVerdict, MergeStrategy};
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, MemoryResult};
use crate::scoring::ScoringService;
use crate::search::{HybridSearch, SearchRequest};
use crate::store::MemoryStore;
use crate::types::{MemoryFilter, MemorySearchResult, MemoryType, MemoryUnit};

/// Queue depth for the fire-and-forget access-counter channel. A bounded
/// channel, not an unstructured `tokio::spawn` per touch, so backpressure is
/// visible instead of unbounded task growth under load.
const ACCESS_QUEUE_CAPACITY: usize = 1024;

enum AccessEvent {
    Touch(Uuid),
}

/// Result of a `remember` call.
#[derive(Debug, Clone)]
pub enum RememberOutcome {
    /// No duplicate was found (or `StoreAnyway` was requested); a new row exists.
    Stored(MemoryUnit),
    /// A duplicate was found and reconciled per `UpdateExisting` or `Merge`.
    Merged(MemoryUnit),
}

impl RememberOutcome {
    pub fn unit(&self) -> &MemoryUnit {
        match self {
            Self::Stored(u) | Self::Merged(u) => u,
        }
    }
}

/// Outcome of `recall`: the ranked, optimized result set plus optimizer
/// bookkeeping.
#[derive(Debug, Clone)]
pub struct RecallOutcome {
    pub results: Vec<MemorySearchResult>,
    pub report: OptimizationReport,
}

/// Top-level facade. Holds the store, the BM25 index (guarded for concurrent
/// reads / exclusive writes), the embedding provider, and the stateless
/// scoring/search/dedup/context components.
pub struct MemoryService<S: MemoryStore, P: EmbeddingProvider, E: QueryExpander> {
    store: Arc<S>,
    embedding: Arc<P>,
    bm25: Arc<RwLock<BM25Index>>,
    scoring: ScoringService,
    duplicate: DuplicateDetector,
    search: HybridSearch,
    context: ContextOptimizer<E>,
    config: MemoryCoreConfig,
    access_tx: Option<mpsc::Sender<AccessEvent>>,
    worker_cancel: CancellationToken,
    worker_handle: JoinHandle<()>,
}

impl<S, P, E> MemoryService<S, P, E>
where
    S: MemoryStore + 'static,
    P: EmbeddingProvider + 'static,
    E: QueryExpander + 'static,
{
    /// Construct the service and spawn the background access-counter worker.
    /// Rebuilds the BM25 index from `store` so it reflects whatever was
    /// persisted before this process started.
    pub async fn new(store: Arc<S>, embedding: Arc<P>, expander: E, config: MemoryCoreConfig) -> MemoryResult<Self> {
        let bm25 = Arc::new(RwLock::new(BM25Index::new()));
        rebuild_bm25_index(&store, &bm25).await?;

        let scoring = ScoringService::new(config.scoring.clone());
        let duplicate = DuplicateDetector::new(config.search.dedup_sim_threshold);
        let search = HybridSearch::new(config.search.clone());
        let context = ContextOptimizer::new(expander);

        let (access_tx, access_rx) = mpsc::channel(ACCESS_QUEUE_CAPACITY);
        let worker_cancel = CancellationToken::new();
        let worker_handle = spawn_access_worker(store.clone(), access_rx, worker_cancel.clone());

        Ok(Self {
            store,
            embedding,
            bm25,
            scoring,
            duplicate,
            search,
            context,
            config,
            access_tx: Some(access_tx),
            worker_cancel,
            worker_handle,
        })
    }

    /// Close the access-counter queue and wait for the background writer to
    /// drain whatever is already queued, instead of leaking the task when the
    /// service is dropped. Does not discard queued touches; for an immediate
    /// abort use `cancel_background_work` first.
    pub async fn shutdown(mut self) -> MemoryResult<()> {
        self.access_tx.take();
        self.worker_handle
            .await
            .map_err(|e| MemoryError::internal(format!("access worker panicked: {e}")))
    }

    /// Signal the background access-counter worker to stop immediately,
    /// discarding anything still queued, rather than draining it.
    pub fn cancel_background_work(&self) {
        self.worker_cancel.cancel();
    }

    /// Store a memory with the default policy (`Merge(CombineContent)`).
    pub async fn remember(
        &self,
        owner: impl Into<String>,
        content: impl Into<String>,
        unit_type: MemoryType,
    ) -> MemoryResult<RememberOutcome> {
        self.remember_with_policy(
            owner,
            content,
            unit_type,
            DuplicatePolicy::Merge(MergeStrategy::CombineContent),
        )
        .await
    }

    /// Store a new memory, embedding its content and checking for exact and
    /// near duplicates against the owner's existing corpus first, then
    /// reconciling per `policy`.
    pub async fn remember_with_policy(
        &self,
        owner: impl Into<String>,
        content: impl Into<String>,
        unit_type: MemoryType,
        policy: DuplicatePolicy,
    ) -> MemoryResult<RememberOutcome> {
        self.remember_with_policy_cancellable(owner, content, unit_type, policy, None)
            .await
    }

    /// Same as `remember_with_policy`, but checks `cancel` before each I/O
    /// call and aborts with `MemoryError::Cancelled` if it has fired.
    pub async fn remember_with_policy_cancellable(
        &self,
        owner: impl Into<String>,
        content: impl Into<String>,
        unit_type: MemoryType,
        policy: DuplicatePolicy,
        cancel: Option<&CancellationToken>,
    ) -> MemoryResult<RememberOutcome> {
        let owner = owner.into();
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MemoryError::invalid_argument("content must not be empty"));
        }

        check_cancelled(cancel)?;
        let mut unit = MemoryUnit::new(&owner, content, unit_type);
        unit.embedding = Some(self.embedding.embed(&unit.content).await?);

        check_cancelled(cancel)?;
        let existing = self
            .store
            .scan_for_vector_search(&MemoryFilter::for_owner(&owner))
            .await?;

        let verdict = self.duplicate.check(&unit, &existing);
        let existing_id = match verdict {
            DuplicateVerdict::Unique => None,
            DuplicateVerdict::ExactDuplicate { existing_id }
            | DuplicateVerdict::NearDuplicate { existing_id, .. } => Some(existing_id),
        };

        let Some(existing_id) = existing_id else {
            check_cancelled(cancel)?;
            self.store.insert(unit.clone()).await?;
            self.bm25.write().add(unit.id, &unit.content);
            return Ok(RememberOutcome::Stored(unit));
        };

        check_cancelled(cancel)?;
        match policy {
            DuplicatePolicy::StoreAnyway => {
                self.store.insert(unit.clone()).await?;
                self.bm25.write().add(unit.id, &unit.content);
                Ok(RememberOutcome::Stored(unit))
            }
            DuplicatePolicy::Skip => Err(MemoryError::Conflict { existing_id }),
            DuplicatePolicy::UpdateExisting => {
                let current = existing
                    .into_iter()
                    .find(|u| u.id == existing_id)
                    .ok_or_else(|| MemoryError::internal("duplicate target vanished mid-check"))?;
                let merged = self.duplicate.merge(&current, &unit, MergeStrategy::KeepNewest);
                self.store.update(merged.clone()).await?;
                self.bm25.write().add(merged.id, &merged.content);
                Ok(RememberOutcome::Merged(merged))
            }
            DuplicatePolicy::Merge(strategy) => {
                let current = existing
                    .into_iter()
                    .find(|u| u.id == existing_id)
                    .ok_or_else(|| MemoryError::internal("duplicate target vanished mid-check"))?;
                let mut merged = self.duplicate.merge(&current, &unit, strategy);
                if merged.content != current.content {
                    merged.embedding = Some(self.embedding.embed(&merged.content).await?);
                }
                self.store.update(merged.clone()).await?;
                self.bm25.write().add(merged.id, &merged.content);
                Ok(RememberOutcome::Merged(merged))
            }
        }
    }

    /// Count of non-deleted memories owned by `owner`.
    pub async fn count_for_owner(&self, owner: impl Into<String>) -> MemoryResult<u64> {
        self.store.count(&MemoryFilter::for_owner(owner)).await
    }

    /// Hybrid search plus context optimization for `query` within `filter`.
    pub async fn recall(
        &self,
        query: &str,
        filter: MemoryFilter,
        limit: usize,
        token_budget: Option<usize>,
    ) -> MemoryResult<RecallOutcome> {
        self.recall_cancellable(query, filter, limit, token_budget, None).await
    }

    /// Same as `recall`, but checks `cancel` before each I/O call and aborts
    /// with `MemoryError::Cancelled` if it has fired.
    pub async fn recall_cancellable(
        &self,
        query: &str,
        filter: MemoryFilter,
        limit: usize,
        token_budget: Option<usize>,
        cancel: Option<&CancellationToken>,
    ) -> MemoryResult<RecallOutcome> {
        check_cancelled(cancel)?;
        let mut query_embedding = self.embedding.embed(query).await?;

        let hyde_applied = self.config.search.use_hyde;
        if hyde_applied {
            check_cancelled(cancel)?;
            query_embedding = self
                .context
                .expand_query(query, &query_embedding, self.embedding.as_ref())
                .await?;
        }

        let effective_limit = limit.max(1);
        let overfetch = effective_limit.max(self.config.search.default_limit) * 2;

        let request = SearchRequest {
            query_text: query,
            query_embedding: Some(&query_embedding),
            filter,
            limit: overfetch,
        };
        check_cancelled(cancel)?;
        let mut results = self
            .search
            .search(&request, self.store.as_ref(), &self.bm25)
            .await?;

        let now = Utc::now();
        for r in &mut results {
            let breakdown = self.scoring.score(&r.unit, Some(&query_embedding), now);
            r.score = (r.score + breakdown.combined) / 2.0;
        }
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.unit.id.cmp(&b.unit.id))
        });
        results.truncate(effective_limit);

        if let Some(tx) = &self.access_tx {
            for r in &results {
                let _ = tx.try_send(AccessEvent::Touch(r.unit.id));
            }
        }

        let (optimized, report) = self.context.optimize(
            results,
            Some(&query_embedding),
            self.config.search.use_mmr,
            self.config.search.mmr_lambda,
            effective_limit,
            token_budget,
            hyde_applied,
        );

        Ok(RecallOutcome {
            results: optimized,
            report,
        })
    }

    pub async fn get(&self, id: Uuid) -> MemoryResult<Option<MemoryUnit>> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        self.store.scan_for_vector_search(filter).await
    }

    /// Replace a unit's content, re-embedding and re-indexing it.
    pub async fn update_content(&self, id: Uuid, content: impl Into<String>) -> MemoryResult<MemoryUnit> {
        let mut unit = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        unit.set_content(content);
        unit.embedding = Some(self.embedding.embed(&unit.content).await?);
        self.store.update(unit.clone()).await?;
        self.bm25.write().add(unit.id, &unit.content);
        Ok(unit)
    }

    /// Update a unit's importance, clamping into `[0, 1]`.
    pub async fn update_importance(&self, id: Uuid, importance: f32) -> MemoryResult<MemoryUnit> {
        let mut unit = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        unit.importance = importance;
        unit.clamp_importance();
        unit.updated_at = Utc::now();
        self.store.update(unit.clone()).await?;
        Ok(unit)
    }

    pub async fn delete(&self, id: Uuid, hard: bool) -> MemoryResult<()> {
        if hard {
            self.store.hard_delete(id).await?;
            self.bm25.write().remove(id);
        } else {
            self.store.soft_delete(id).await?;
        }
        Ok(())
    }

    pub fn scoring(&self) -> &ScoringService {
        &self.scoring
    }

    /// Replay the BM25 index from the store's current content. A failed
    /// `update_content` commits the row before the in-process BM25 update, so
    /// a crash between those two steps leaves BM25 stale until this is called
    /// (normally done once, at startup, inside `new`).
    pub async fn rebuild_bm25_index(&self) -> MemoryResult<()> {
        rebuild_bm25_index(&self.store, &self.bm25).await
    }
}

async fn rebuild_bm25_index<S: MemoryStore>(
    store: &Arc<S>,
    bm25: &Arc<RwLock<BM25Index>>,
) -> MemoryResult<()> {
    let all = store.scan_for_text_search(&MemoryFilter::default()).await?;
    {
        let mut index = bm25.write();
        index.clear();
        for unit in &all {
            index.add(unit.id, &unit.content);
        }
    }
    debug!(indexed = all.len(), "rebuilt BM25 index from store");
    Ok(())
}

fn check_cancelled(cancel: Option<&CancellationToken>) -> MemoryResult<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(MemoryError::Cancelled),
        _ => Ok(()),
    }
}

fn spawn_access_worker<S: MemoryStore + 'static>(
    store: Arc<S>,
    mut rx: mpsc::Receiver<AccessEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(AccessEvent::Touch(id)) = event else { break };
                    if let Err(e) = store.touch(id, Utc::now()).await {
                        warn!(memory_id = %id, error = %e, "failed to record memory access");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeuristicQueryExpander;
    use crate::embedding::HashingEmbeddingProvider;
    use crate::store::memory_backend::InMemoryStore;

    async fn service() -> MemoryService<InMemoryStore, HashingEmbeddingProvider, HeuristicQueryExpander> {
        MemoryService::new(
            Arc::new(InMemoryStore::new(32)),
            Arc::new(HashingEmbeddingProvider::new(32)),
            HeuristicQueryExpander,
            MemoryCoreConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn remember_then_recall_finds_it() {
        let svc = service().await;
        svc.remember("alice", "React Node Mongo stack", MemoryType::Fact)
            .await
            .unwrap();
        let outcome = svc
            .recall("Node stack", MemoryFilter::for_owner("alice"), 5, None)
            .await
            .unwrap();
        assert!(!outcome.results.is_empty());
    }

    #[tokio::test]
    async fn remembering_identical_content_twice_merges() {
        let svc = service().await;
        let first = svc.remember("alice", "duplicate content here", MemoryType::Fact).await.unwrap();
        let second = svc.remember("alice", "duplicate content here", MemoryType::Fact).await.unwrap();
        match (first, second) {
            (RememberOutcome::Stored(u1), RememberOutcome::Merged(u2)) => assert_eq!(u1.id, u2.id),
            other => panic!("expected stored-then-merged, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_content_is_rejected() {
        let svc = service().await;
        let err = svc.remember("alice", "   ", MemoryType::Fact).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn delete_hard_removes_from_bm25() {
        let svc = service().await;
        let outcome = svc.remember("alice", "some fact to delete", MemoryType::Fact).await.unwrap();
        let id = outcome.unit().id;
        svc.delete(id, true).await.unwrap();
        assert!(svc.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_importance_clamps_out_of_range_values() {
        let svc = service().await;
        let outcome = svc.remember("alice", "importance test", MemoryType::Fact).await.unwrap();
        let id = outcome.unit().id;
        let updated = svc.update_importance(id, 5.0).await.unwrap();
        assert_eq!(updated.importance, 1.0);
    }

    #[tokio::test]
    async fn skip_policy_leaves_existing_row_untouched() {
        let svc = service().await;
        let first = svc
            .remember_with_policy("u", "The capital of France is Paris.", MemoryType::Fact, DuplicatePolicy::Skip)
            .await
            .unwrap();
        let err = svc
            .remember_with_policy("u", "The capital of France is Paris.", MemoryType::Fact, DuplicatePolicy::Skip)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Conflict { existing_id } if existing_id == first.unit().id));
        assert_eq!(svc.count_for_owner("u").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hyde_expansion_is_reported_when_enabled() {
        let mut config = MemoryCoreConfig::default();
        config.search.use_hyde = true;
        let svc = MemoryService::new(
            Arc::new(InMemoryStore::new(32)),
            Arc::new(HashingEmbeddingProvider::new(32)),
            HeuristicQueryExpander,
            config,
        )
        .await
        .unwrap();
        svc.remember("alice", "how to configure retries safely", MemoryType::Fact)
            .await
            .unwrap();

        let outcome = svc
            .recall("How do I configure retries?", MemoryFilter::for_owner("alice"), 5, None)
            .await
            .unwrap();
        assert!(outcome.report.hyde_applied);
    }

    #[tokio::test]
    async fn rebuild_bm25_index_recovers_from_a_fresh_index() {
        let store = Arc::new(InMemoryStore::new(32));
        let svc = MemoryService::new(
            store.clone(),
            Arc::new(HashingEmbeddingProvider::new(32)),
            HeuristicQueryExpander,
            MemoryCoreConfig::default(),
        )
        .await
        .unwrap();
        svc.remember("alice", "a fact indexed before the crash", MemoryType::Fact)
            .await
            .unwrap();

        // Simulate starting a second service instance against the same store
        // without replaying BM25 from disk yet.
        let svc2 = MemoryService::new(
            store.clone(),
            Arc::new(HashingEmbeddingProvider::new(32)),
            HeuristicQueryExpander,
            MemoryCoreConfig::default(),
        )
        .await
        .unwrap();
        svc2.rebuild_bm25_index().await.unwrap();

        let outcome = svc2
            .recall("fact indexed before the crash", MemoryFilter::for_owner("alice"), 5, None)
            .await
            .unwrap();
        assert!(!outcome.results.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_aborts_remember_before_any_write() {
        let svc = service().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = svc
            .remember_with_policy_cancellable(
                "alice",
                "should never be stored",
                MemoryType::Fact,
                DuplicatePolicy::StoreAnyway,
                Some(&token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Cancelled));
        assert_eq!(svc.count_for_owner("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_pending_access_events() {
        let store = Arc::new(InMemoryStore::new(32));
        let svc = MemoryService::new(
            store.clone(),
            Arc::new(HashingEmbeddingProvider::new(32)),
            HeuristicQueryExpander,
            MemoryCoreConfig::default(),
        )
        .await
        .unwrap();

        let outcome = svc.remember("alice", "touched by recall", MemoryType::Fact).await.unwrap();
        let id = outcome.unit().id;
        svc.recall("touched by recall", MemoryFilter::for_owner("alice"), 5, None)
            .await
            .unwrap();
        svc.shutdown().await.unwrap();

        let touched = store.get(id).await.unwrap().unwrap();
        assert_eq!(touched.access_count, 1);
    }

    #[tokio::test]
    async fn combine_content_policy_sums_access_counts() {
        let svc = service().await;
        svc.remember_with_policy(
            "u",
            "same fact twice",
            MemoryType::Fact,
            DuplicatePolicy::Merge(MergeStrategy::CombineContent),
        )
        .await
        .unwrap();
        let second = svc
            .remember_with_policy(
                "u",
                "same fact twice",
                MemoryType::Fact,
                DuplicatePolicy::Merge(MergeStrategy::CombineContent),
            )
            .await
            .unwrap();
        assert!(matches!(second, RememberOutcome::Merged(_)));
        assert_eq!(svc.count_for_owner("u").await.unwrap(), 1);
    }
}
