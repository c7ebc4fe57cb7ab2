//! `EmbeddingProvider` boundary: the trait external embedding models plug
//! into, a deterministic test double, and a caching decorator that enforces
//! a concurrency cap and deduplicates in-flight requests for the same text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::sync::Semaphore;

use crate::error::{MemoryError, MemoryResult};

/// Boundary trait for turning text into a dense vector. Implementations
/// cross an I/O boundary (an HTTP call to an embedding model) and so are
/// async; everything downstream of this trait is synchronous.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single piece of text.
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>>;

    /// Embed a batch. The default implementation calls `embed` once per item;
    /// providers backed by a batching API should override this.
    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of vectors this provider produces.
    fn dimensions(&self) -> usize;
}

/// Deterministic, dependency-free embedding provider for tests: hashes the
/// token sequence into a fixed-size vector. Not meant to carry any semantic
/// signal beyond exact/near token overlap.
pub struct HashingEmbeddingProvider {
    dimensions: usize,
}

impl HashingEmbeddingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for HashingEmbeddingProvider {
    fn default() -> Self {
        Self::new(64)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut v = vec![0.0f32; self.dimensions];
        for term in crate::tokenizer::tokenize(text) {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::hash::Hash::hash(&term, &mut hasher);
            let idx = (std::hash::Hasher::finish(&hasher) as usize) % self.dimensions;
            v[idx] += 1.0;
        }
        Ok(crate::vector_math::normalize(&v))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// `SHA-256(provider_id ‖ model ‖ text)`, hex-encoded. Scoping the key on
/// provider and model means switching either invalidates the cache instead of
/// serving a stale vector computed by a different embedding space.
fn cache_key(provider_id: &str, model: &str, text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(model.as_bytes());
    hasher.update(b"\0");
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Decorates any `EmbeddingProvider` with a TTL cache keyed on
/// `provider_id`/`model`/text and a semaphore bounding how many embed calls
/// are in flight at once. `get_with`/`try_get_with` guarantee a cache miss is
/// computed exactly once even when concurrent callers race on the same key,
/// unlike a manual get-then-insert pair.
pub struct CachedEmbeddingProvider<P: EmbeddingProvider> {
    inner: P,
    provider_id: String,
    model: String,
    cache: Cache<String, Arc<Vec<f32>>>,
    limiter: Arc<Semaphore>,
    max_batch_size: usize,
}

impl<P: EmbeddingProvider> CachedEmbeddingProvider<P> {
    pub fn new(inner: P, ttl: Duration, max_concurrency: usize) -> Self {
        Self::with_batch_limit(inner, ttl, max_concurrency, usize::MAX)
    }

    /// Same as `new`, but `embed_batch` rejects inputs longer than
    /// `max_batch_size` with `InvalidArgument` instead of silently chunking
    /// them across separate cache keys.
    pub fn with_batch_limit(inner: P, ttl: Duration, max_concurrency: usize, max_batch_size: usize) -> Self {
        Self::with_identity(inner, "default", "default", ttl, max_concurrency, max_batch_size)
    }

    /// Same as `with_batch_limit`, naming the provider/model used to scope
    /// cache keys. Use this whenever the inner provider isn't a singleton for
    /// its provider/model pair (e.g. the process serves more than one model).
    pub fn with_identity(
        inner: P,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        ttl: Duration,
        max_concurrency: usize,
        max_batch_size: usize,
    ) -> Self {
        let cache = Cache::builder().time_to_live(ttl).build();
        Self {
            inner,
            provider_id: provider_id.into(),
            model: model.into(),
            cache,
            limiter: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_batch_size,
        }
    }
}

#[async_trait]
impl<P: EmbeddingProvider> EmbeddingProvider for CachedEmbeddingProvider<P> {
    async fn embed(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let key = cache_key(&self.provider_id, &self.model, text);
        let result = self
            .cache
            .try_get_with(key, async {
                let _permit = self
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| MemoryError::internal("embedding semaphore closed"))?;
                let embedding = self.inner.embed(text).await?;
                Ok::<_, MemoryError>(Arc::new(embedding))
            })
            .await;

        match result {
            Ok(embedding) => Ok((*embedding).clone()),
            Err(shared) => Err(MemoryError::internal(shared.to_string())),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        if texts.len() > self.max_batch_size {
            return Err(MemoryError::invalid_argument(format!(
                "batch of {} exceeds configured max of {}",
                texts.len(),
                self.max_batch_size
            )));
        }
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}
