//! Qdrant-backed `MemoryStore`: remote vector collection with the full
//! `MemoryUnit` round-tripped through the point payload, since Qdrant has no
//! native row store for us to fall back on for `scan_for_text_search`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, PointId, PointStruct,
    ScrollPointsBuilder, SetPayloadPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
    DeletePointsBuilder,
};
use qdrant_client::Qdrant;
use uuid::Uuid;

use crate::bm25::BM25Index;
use crate::error::{MemoryError, MemoryResult};
use crate::store::MemoryStore;
use crate::types::{MemoryFilter, MemoryType, MemoryUnit};
use crate::vector_math;

pub struct QdrantStore {
    client: Qdrant,
    collection: String,
    dimensions: u64,
}

impl QdrantStore {
    pub async fn connect(url: &str, collection: &str, dimensions: u64) -> MemoryResult<Self> {
        let client = Qdrant::from_url(url)
            .skip_compatibility_check()
            .build()
            .map_err(|e| MemoryError::storage(format!("connecting to qdrant: {e}")))?;

        let store = Self {
            client,
            collection: collection.to_string(),
            dimensions,
        };
        store.ensure_collection(dimensions).await?;
        Ok(store)
    }

    async fn ensure_collection(&self, dimensions: u64) -> MemoryResult<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| MemoryError::storage(e.to_string()))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(dimensions, Distance::Cosine)),
                )
                .await
                .map_err(|e| MemoryError::storage(format!("creating collection: {e}")))?;
        }
        Ok(())
    }

    fn unit_to_payload(unit: &MemoryUnit) -> HashMap<String, qdrant_client::qdrant::Value> {
        let mut payload = HashMap::new();
        payload.insert("owner".to_string(), unit.owner.clone().into());
        payload.insert("content".to_string(), unit.content.clone().into());
        payload.insert(
            "session_id".to_string(),
            unit.session_id.map(|s| s.to_string()).unwrap_or_default().into(),
        );
        payload.insert("created_at".to_string(), unit.created_at.timestamp().into());
        payload.insert("updated_at".to_string(), unit.updated_at.timestamp().into());
        payload.insert(
            "last_accessed_at".to_string(),
            unit.last_accessed_at.map(|t| t.timestamp()).unwrap_or(0).into(),
        );
        payload.insert("importance".to_string(), (unit.importance as f64).into());
        payload.insert("access_count".to_string(), (unit.access_count as i64).into());
        payload.insert("unit_type".to_string(), unit.unit_type.as_i64().into());
        payload.insert("content_hash".to_string(), unit.content_hash.clone().into());
        payload.insert(
            "topics".to_string(),
            serde_json::to_string(&unit.topics).unwrap_or_default().into(),
        );
        payload.insert(
            "entities".to_string(),
            serde_json::to_string(&unit.entities).unwrap_or_default().into(),
        );
        payload.insert(
            "metadata".to_string(),
            serde_json::to_string(&unit.metadata).unwrap_or_default().into(),
        );
        payload.insert("is_deleted".to_string(), unit.is_deleted.into());
        payload
    }

    fn payload_to_unit(id: Uuid, embedding: Vec<f32>, payload: &HashMap<String, qdrant_client::qdrant::Value>) -> MemoryResult<MemoryUnit> {
        let get_str = |k: &str| -> String {
            payload
                .get(k)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default()
        };
        let get_int = |k: &str| -> i64 { payload.get(k).and_then(|v| v.as_integer()).unwrap_or(0) };
        let get_f64 = |k: &str| -> f64 { payload.get(k).and_then(|v| v.as_double()).unwrap_or(0.0) };
        let get_bool = |k: &str| -> bool { payload.get(k).and_then(|v| v.as_bool()).unwrap_or(false) };

        let session_id_raw = get_str("session_id");
        let session_id = if session_id_raw.is_empty() {
            None
        } else {
            Uuid::parse_str(&session_id_raw).ok()
        };
        let last_accessed = get_int("last_accessed_at");

        Ok(MemoryUnit {
            id,
            owner: get_str("owner"),
            session_id,
            content: get_str("content"),
            embedding: Some(embedding),
            created_at: timestamp_to_utc(get_int("created_at")),
            updated_at: timestamp_to_utc(get_int("updated_at")),
            last_accessed_at: if last_accessed == 0 {
                None
            } else {
                Some(timestamp_to_utc(last_accessed))
            },
            importance: get_f64("importance") as f32,
            access_count: get_int("access_count") as u64,
            unit_type: MemoryType::from_i64(get_int("unit_type")).unwrap_or(MemoryType::Fact),
            content_hash: get_str("content_hash"),
            topics: serde_json::from_str(&get_str("topics")).unwrap_or_default(),
            entities: serde_json::from_str(&get_str("entities")).unwrap_or_default(),
            metadata: serde_json::from_str(&get_str("metadata")).unwrap_or_default(),
            is_deleted: get_bool("is_deleted"),
        })
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl MemoryStore for QdrantStore {
    async fn insert(&self, unit: MemoryUnit) -> MemoryResult<()> {
        let embedding = unit
            .embedding
            .clone()
            .ok_or_else(|| MemoryError::invalid_argument("qdrant store requires an embedding"))?;
        if embedding.len() as u64 != self.dimensions {
            return Err(MemoryError::shape(self.dimensions as usize, embedding.len()));
        }
        if self.get(unit.id).await?.is_some() {
            return Err(MemoryError::Conflict { existing_id: unit.id });
        }

        let point = PointStruct::new(unit.id.to_string(), embedding, Self::unit_to_payload(&unit));
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(|e| MemoryError::storage(format!("upsert: {e}")))?;
        Ok(())
    }

    async fn update(&self, unit: MemoryUnit) -> MemoryResult<()> {
        let embedding = unit
            .embedding
            .clone()
            .ok_or_else(|| MemoryError::invalid_argument("qdrant store requires an embedding"))?;
        if embedding.len() as u64 != self.dimensions {
            return Err(MemoryError::shape(self.dimensions as usize, embedding.len()));
        }
        if self.get(unit.id).await?.is_none() {
            return Err(MemoryError::not_found(format!("memory {}", unit.id)));
        }
        let point = PointStruct::new(unit.id.to_string(), embedding, Self::unit_to_payload(&unit));
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(|e| MemoryError::storage(format!("upsert: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MemoryResult<Option<MemoryUnit>> {
        let points = self
            .client
            .get_points(
                qdrant_client::qdrant::GetPointsBuilder::new(&self.collection, vec![PointId::from(id.to_string())])
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await
            .map_err(|e| MemoryError::storage(format!("get: {e}")))?;

        let Some(point) = points.result.into_iter().next() else {
            return Ok(None);
        };
        let embedding = point
            .vectors
            .and_then(|v| v.vectors_options)
            .and_then(|opt| match opt {
                qdrant_client::qdrant::vectors::VectorsOptions::Vector(v) => Some(v.data),
                _ => None,
            })
            .unwrap_or_default();
        Ok(Some(Self::payload_to_unit(id, embedding, &point.payload)?))
    }

    async fn get_many(&self, ids: &[Uuid]) -> MemoryResult<Vec<MemoryUnit>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(u) = self.get(*id).await? {
                out.push(u);
            }
        }
        Ok(out)
    }

    async fn soft_delete(&self, id: Uuid) -> MemoryResult<()> {
        let mut payload = HashMap::new();
        payload.insert("is_deleted".to_string(), true.into());
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points(vec![PointId::from(id.to_string())])
                    .wait(true),
            )
            .await
            .map_err(|e| MemoryError::storage(format!("soft delete: {e}")))?;
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> MemoryResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(vec![PointId::from(id.to_string())])
                    .wait(true),
            )
            .await
            .map_err(|e| MemoryError::storage(format!("hard delete: {e}")))?;
        Ok(())
    }

    async fn scan_for_vector_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        let mut conditions = Vec::new();
        if let Some(ref owner) = filter.owner {
            conditions.push(Condition::matches("owner", owner.clone()));
        }
        let qdrant_filter = if conditions.is_empty() {
            None
        } else {
            Some(Filter::must(conditions))
        };

        let mut builder = ScrollPointsBuilder::new(&self.collection)
            .with_payload(true)
            .with_vectors(true)
            .limit(10_000);
        if let Some(f) = qdrant_filter {
            builder = builder.filter(f);
        }

        let response = self
            .client
            .scroll(builder)
            .await
            .map_err(|e| MemoryError::storage(format!("scroll: {e}")))?;

        let mut units = Vec::with_capacity(response.result.len());
        for point in response.result {
            let Some(PointId { point_id_options: Some(opts) }) = point.id else {
                continue;
            };
            let id = match opts {
                qdrant_client::qdrant::point_id::PointIdOptions::Uuid(s) => {
                    Uuid::parse_str(&s).ok()
                }
                _ => None,
            };
            let Some(id) = id else { continue };
            let embedding = point
                .vectors
                .and_then(|v| v.vectors_options)
                .and_then(|opt| match opt {
                    qdrant_client::qdrant::vectors::VectorsOptions::Vector(v) => Some(v.data),
                    _ => None,
                })
                .unwrap_or_default();
            let unit = Self::payload_to_unit(id, embedding, &point.payload)?;
            if filter.matches(&unit) {
                units.push(unit);
            }
        }
        Ok(units)
    }

    async fn scan_for_text_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        self.scan_for_vector_search(filter).await
    }

    /// Qdrant has no row store of its own; the full unit already round-trips
    /// through the point payload, so a filtered scan plus a local cosine pass
    /// over the fetched candidates gives the same ranked-pair contract as a
    /// SQL-backed store without adding a second storage engine.
    async fn search(
        &self,
        query_vec: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f32,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        let candidates = self.scan_for_vector_search(filter).await?;
        let mut scored: Vec<(MemoryUnit, f32)> = candidates
            .into_iter()
            .filter_map(|u| {
                let score = u
                    .embedding
                    .as_deref()
                    .and_then(|e| vector_math::cosine(e, query_vec).ok())?;
                Some((u, score))
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

    /// Qdrant has no native FTS engine either; build a transient BM25 index
    /// from the scanned content. Pragmatic given this store's scale, rather
    /// than standing up a second persistent index alongside the collection.
    async fn fts(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        let matching = self.scan_for_text_search(filter).await?;
        let mut index = BM25Index::new();
        for u in &matching {
            index.add(u.id, &u.content);
        }
        let ranked = index.search(query, limit);
        let by_id: std::collections::HashMap<Uuid, MemoryUnit> =
            matching.into_iter().map(|u| (u.id, u)).collect();
        Ok(ranked
            .into_iter()
            .filter_map(|(id, raw)| by_id.get(&id).map(|u| (u.clone(), 1.0 / (1.0 + raw.abs()))))
            .collect())
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> MemoryResult<()> {
        let unit = self
            .get(id)
            .await?
            .ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        let mut payload = HashMap::new();
        payload.insert(
            "access_count".to_string(),
            (unit.access_count as i64 + 1).into(),
        );
        payload.insert("last_accessed_at".to_string(), now.timestamp().into());
        self.client
            .set_payload(
                SetPayloadPointsBuilder::new(&self.collection, payload)
                    .points(vec![PointId::from(id.to_string())])
                    .wait(true),
            )
            .await
            .map_err(|e| MemoryError::storage(format!("touch: {e}")))?;
        Ok(())
    }

    async fn count(&self, filter: &MemoryFilter) -> MemoryResult<u64> {
        Ok(self.scan_for_vector_search(filter).await?.len() as u64)
    }
}
