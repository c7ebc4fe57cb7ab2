//! Persistent store contract: backends implement CRUD plus the filtered
//! vector/text scans and ranked vector/FTS searches the search layer and
//! callers need, without knowing anything about BM25 or cosine scoring
//! themselves (ranking math lives in `vector_math`/`bm25`, invoked from
//! within each backend).

pub mod memory_backend;
pub mod qdrant;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{MemoryError, MemoryResult};
use crate::types::{MemoryFilter, MemoryUnit};

/// Storage backend for `MemoryUnit`s. Implementors own durability and
/// indexing; the search and scoring layers only ever see what this trait
/// exposes.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert a brand new unit. Errors with `Conflict` if `unit.id` exists,
    /// or `Shape` if the unit carries an embedding of the wrong dimension.
    async fn insert(&self, unit: MemoryUnit) -> MemoryResult<()>;

    /// Replace an existing unit wholesale. Errors with `NotFound` if absent,
    /// or `Shape` if the unit carries an embedding of the wrong dimension.
    async fn update(&self, unit: MemoryUnit) -> MemoryResult<()>;

    /// Fetch by id, regardless of soft-delete state.
    async fn get(&self, id: Uuid) -> MemoryResult<Option<MemoryUnit>>;

    /// Fetch several ids at once. Missing ids are simply absent from the
    /// result rather than an error.
    async fn get_many(&self, ids: &[Uuid]) -> MemoryResult<Vec<MemoryUnit>>;

    /// Soft delete: sets `is_deleted = true` rather than removing the row.
    async fn soft_delete(&self, id: Uuid) -> MemoryResult<()>;

    /// Hard delete: removes the row (and any index entries) permanently.
    async fn hard_delete(&self, id: Uuid) -> MemoryResult<()>;

    /// All non-deleted units matching `filter`, in no particular order.
    /// Backends that hold an embedding index may use this as the candidate
    /// set for a brute-force or ANN vector scan.
    async fn scan_for_vector_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>>;

    /// All non-deleted units matching `filter`, for rebuilding or querying a
    /// lexical index. For most backends this is identical to
    /// `scan_for_vector_search`; split out so a backend backed by a remote
    /// vector store (no local content) can still serve full-text scans.
    async fn scan_for_text_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>>;

    /// Units matching `filter`, ranked by cosine similarity to `query_vec`
    /// descending (ties broken by ascending id), dropping anything scoring
    /// below `min_score`, truncated to `limit`.
    async fn search(
        &self,
        query_vec: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f32,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>>;

    /// Units matching `filter` whose content matches `query`, ranked by a
    /// lexical scorer (BM25) and normalized to `1 / (1 + |raw_score|)`,
    /// truncated to `limit`.
    async fn fts(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>>;

    /// Increment `access_count` and bump `last_accessed_at` to `now`.
    async fn touch(&self, id: Uuid, now: chrono::DateTime<chrono::Utc>) -> MemoryResult<()>;

    /// Count of non-deleted units matching `filter`.
    async fn count(&self, filter: &MemoryFilter) -> MemoryResult<u64>;
}

/// Validates `unit.embedding`'s length against `expected`, the backend's
/// configured dimension. `expected == 0` means no fixed dimension is
/// enforced (used by tests that never set an embedding). Call before any
/// write so a mismatch never reaches storage.
pub(crate) fn check_embedding_dimensions(expected: usize, unit: &MemoryUnit) -> MemoryResult<()> {
    if expected == 0 {
        return Ok(());
    }
    if let Some(embedding) = unit.embedding.as_ref() {
        if embedding.len() != expected {
            return Err(MemoryError::shape(expected, embedding.len()));
        }
    }
    Ok(())
}
