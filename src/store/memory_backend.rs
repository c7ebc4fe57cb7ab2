//! In-process `MemoryStore` used by tests and as a reference implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::bm25::BM25Index;
use crate::error::{MemoryError, MemoryResult};
use crate::store::{check_embedding_dimensions, MemoryStore};
use crate::types::{MemoryFilter, MemoryUnit};
use crate::vector_math;

pub struct InMemoryStore {
    units: RwLock<HashMap<Uuid, MemoryUnit>>,
    dimensions: usize,
}

impl InMemoryStore {
    /// `dimensions == 0` disables dimension enforcement on insert/update.
    pub fn new(dimensions: usize) -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
            dimensions,
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn insert(&self, unit: MemoryUnit) -> MemoryResult<()> {
        check_embedding_dimensions(self.dimensions, &unit)?;
        let mut units = self.units.write();
        if units.contains_key(&unit.id) {
            return Err(MemoryError::Conflict {
                existing_id: unit.id,
            });
        }
        units.insert(unit.id, unit);
        Ok(())
    }

    async fn update(&self, unit: MemoryUnit) -> MemoryResult<()> {
        check_embedding_dimensions(self.dimensions, &unit)?;
        let mut units = self.units.write();
        if !units.contains_key(&unit.id) {
            return Err(MemoryError::not_found(format!("memory {}", unit.id)));
        }
        units.insert(unit.id, unit);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MemoryResult<Option<MemoryUnit>> {
        Ok(self.units.read().get(&id).cloned())
    }

    async fn get_many(&self, ids: &[Uuid]) -> MemoryResult<Vec<MemoryUnit>> {
        let units = self.units.read();
        Ok(ids.iter().filter_map(|id| units.get(id).cloned()).collect())
    }

    async fn soft_delete(&self, id: Uuid) -> MemoryResult<()> {
        let mut units = self.units.write();
        let unit = units
            .get_mut(&id)
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        unit.is_deleted = true;
        unit.updated_at = Utc::now();
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> MemoryResult<()> {
        self.units
            .write()
            .remove(&id)
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        Ok(())
    }

    async fn scan_for_vector_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        Ok(self
            .units
            .read()
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect())
    }

    async fn scan_for_text_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        self.scan_for_vector_search(filter).await
    }

    async fn search(
        &self,
        query_vec: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f32,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        let mut scored: Vec<(MemoryUnit, f32)> = self
            .units
            .read()
            .values()
            .filter(|u| filter.matches(u))
            .filter_map(|u| {
                let emb = u.embedding.as_deref()?;
                let score = vector_math::cosine(emb, query_vec).ok()?;
                Some((u.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        scored.retain(|(_, s)| *s >= min_score);
        scored.truncate(limit);
        Ok(scored)
    }

    async fn fts(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        let matching: Vec<MemoryUnit> = self
            .units
            .read()
            .values()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect();

        let mut index = BM25Index::new();
        for u in &matching {
            index.add(u.id, &u.content);
        }
        let ranked = index.search(query, limit);
        let by_id: HashMap<Uuid, MemoryUnit> = matching.into_iter().map(|u| (u.id, u)).collect();
        Ok(ranked
            .into_iter()
            .filter_map(|(id, raw)| by_id.get(&id).map(|u| (u.clone(), 1.0 / (1.0 + raw.abs()))))
            .collect())
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> MemoryResult<()> {
        let mut units = self.units.write();
        let unit = units
            .get_mut(&id)
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        unit.access_count += 1;
        unit.last_accessed_at = Some(now);
        Ok(())
    }

    async fn count(&self, filter: &MemoryFilter) -> MemoryResult<u64> {
        Ok(self
            .units
            .read()
            .values()
            .filter(|u| filter.matches(u))
            .count() as u64)
    }
}
