//! SQLite-backed `MemoryStore`: a `memory_units` row table, an FTS5 virtual
//! table kept in sync by triggers, and embeddings stored as a packed f32 BLOB
//! scanned brute-force (fine at the scale this engine targets; a dedicated
//! ANN index is the `QdrantStore`'s job).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{MemoryError, MemoryResult};
use crate::store::{check_embedding_dimensions, MemoryStore};
use crate::types::{MemoryFilter, MemoryType, MemoryUnit};
use crate::vector_math;

pub struct SqliteStore {
    pool: SqlitePool,
    dimensions: usize,
}

impl SqliteStore {
    /// Connect to `connection` (e.g. `sqlite::memory:` or `sqlite:path/to.db`)
    /// and run migrations, enabling WAL mode when `wal` is set. `dimensions
    /// == 0` disables dimension enforcement on insert/update.
    pub async fn connect(connection: &str, wal: bool, dimensions: usize) -> MemoryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(connection)
            .await
            .map_err(MemoryError::from)?;

        if wal {
            sqlx::query("PRAGMA journal_mode=WAL")
                .execute(&pool)
                .await
                .map_err(MemoryError::from)?;
            sqlx::query("PRAGMA synchronous=NORMAL")
                .execute(&pool)
                .await
                .map_err(MemoryError::from)?;
        }

        let store = Self { pool, dimensions };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> MemoryResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_units (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                session_id TEXT,
                content TEXT NOT NULL,
                embedding BLOB,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_accessed_at INTEGER,
                importance REAL NOT NULL,
                access_count INTEGER NOT NULL,
                unit_type INTEGER NOT NULL,
                content_hash TEXT NOT NULL,
                topics TEXT NOT NULL,
                entities TEXT NOT NULL,
                metadata TEXT NOT NULL,
                is_deleted INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_units_owner ON memory_units(owner)",
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS memory_units_fts USING fts5(
                content,
                content='memory_units',
                content_rowid='rowid',
                tokenize='unicode61'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS memory_units_ai AFTER INSERT ON memory_units BEGIN
                INSERT INTO memory_units_fts(rowid, content) VALUES (new.rowid, new.content);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS memory_units_ad AFTER DELETE ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS memory_units_au AFTER UPDATE ON memory_units BEGIN
                INSERT INTO memory_units_fts(memory_units_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
                INSERT INTO memory_units_fts(rowid, content) VALUES (new.rowid, new.content);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        Ok(())
    }

    fn encode_embedding(embedding: &Option<Vec<f32>>) -> Option<Vec<u8>> {
        embedding.as_ref().map(|v| {
            let mut bytes = Vec::with_capacity(v.len() * 4);
            for x in v {
                bytes.extend_from_slice(&x.to_le_bytes());
            }
            bytes
        })
    }

    fn decode_embedding(bytes: Option<Vec<u8>>) -> Option<Vec<f32>> {
        bytes.map(|b| {
            b.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        })
    }

    fn row_to_unit(row: &sqlx::sqlite::SqliteRow) -> MemoryResult<MemoryUnit> {
        let id: String = row.try_get("id").map_err(MemoryError::from)?;
        let session_id: Option<String> = row.try_get("session_id").map_err(MemoryError::from)?;
        let topics_json: String = row.try_get("topics").map_err(MemoryError::from)?;
        let entities_json: String = row.try_get("entities").map_err(MemoryError::from)?;
        let metadata_json: String = row.try_get("metadata").map_err(MemoryError::from)?;
        let unit_type: i64 = row.try_get("unit_type").map_err(MemoryError::from)?;
        let created_at: i64 = row.try_get("created_at").map_err(MemoryError::from)?;
        let updated_at: i64 = row.try_get("updated_at").map_err(MemoryError::from)?;
        let last_accessed_at: Option<i64> =
            row.try_get("last_accessed_at").map_err(MemoryError::from)?;
        let embedding_bytes: Option<Vec<u8>> = row.try_get("embedding").map_err(MemoryError::from)?;

        Ok(MemoryUnit {
            id: Uuid::parse_str(&id).map_err(|e| MemoryError::storage(e.to_string()))?,
            owner: row.try_get("owner").map_err(MemoryError::from)?,
            session_id: session_id
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .map_err(|e| MemoryError::storage(e.to_string()))?,
            content: row.try_get("content").map_err(MemoryError::from)?,
            embedding: Self::decode_embedding(embedding_bytes),
            created_at: timestamp_to_utc(created_at),
            updated_at: timestamp_to_utc(updated_at),
            last_accessed_at: last_accessed_at.map(timestamp_to_utc),
            importance: row.try_get("importance").map_err(MemoryError::from)?,
            access_count: {
                let v: i64 = row.try_get("access_count").map_err(MemoryError::from)?;
                v as u64
            },
            unit_type: MemoryType::from_i64(unit_type)
                .ok_or_else(|| MemoryError::storage("unknown unit_type"))?,
            content_hash: row.try_get("content_hash").map_err(MemoryError::from)?,
            topics: serde_json::from_str(&topics_json).unwrap_or_default(),
            entities: serde_json::from_str(&entities_json).unwrap_or_default(),
            metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
            is_deleted: {
                let v: i64 = row.try_get("is_deleted").map_err(MemoryError::from)?;
                v != 0
            },
        })
    }

    async fn scan(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        let rows = sqlx::query("SELECT * FROM memory_units WHERE owner = ? OR ?1 IS NULL")
            .bind(filter.owner.clone())
            .fetch_all(&self.pool)
            .await
            .map_err(MemoryError::from)?;

        let mut units = Vec::with_capacity(rows.len());
        for row in &rows {
            let unit = Self::row_to_unit(row)?;
            if filter.matches(&unit) {
                units.push(unit);
            }
        }
        Ok(units)
    }
}

fn timestamp_to_utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn insert(&self, unit: MemoryUnit) -> MemoryResult<()> {
        check_embedding_dimensions(self.dimensions, &unit)?;
        let existing = self.get(unit.id).await?;
        if existing.is_some() {
            return Err(MemoryError::Conflict {
                existing_id: unit.id,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO memory_units (
                id, owner, session_id, content, embedding, created_at, updated_at,
                last_accessed_at, importance, access_count, unit_type, content_hash,
                topics, entities, metadata, is_deleted
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(unit.id.to_string())
        .bind(&unit.owner)
        .bind(unit.session_id.map(|s| s.to_string()))
        .bind(&unit.content)
        .bind(Self::encode_embedding(&unit.embedding))
        .bind(unit.created_at.timestamp())
        .bind(unit.updated_at.timestamp())
        .bind(unit.last_accessed_at.map(|t| t.timestamp()))
        .bind(unit.importance)
        .bind(unit.access_count as i64)
        .bind(unit.unit_type.as_i64())
        .bind(&unit.content_hash)
        .bind(serde_json::to_string(&unit.topics).unwrap_or_default())
        .bind(serde_json::to_string(&unit.entities).unwrap_or_default())
        .bind(serde_json::to_string(&unit.metadata).unwrap_or_default())
        .bind(unit.is_deleted as i64)
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        Ok(())
    }

    async fn update(&self, unit: MemoryUnit) -> MemoryResult<()> {
        check_embedding_dimensions(self.dimensions, &unit)?;
        let result = sqlx::query(
            r#"
            UPDATE memory_units SET
                owner = ?, session_id = ?, content = ?, embedding = ?, updated_at = ?,
                last_accessed_at = ?, importance = ?, access_count = ?, unit_type = ?,
                content_hash = ?, topics = ?, entities = ?, metadata = ?, is_deleted = ?
            WHERE id = ?
            "#,
        )
        .bind(&unit.owner)
        .bind(unit.session_id.map(|s| s.to_string()))
        .bind(&unit.content)
        .bind(Self::encode_embedding(&unit.embedding))
        .bind(unit.updated_at.timestamp())
        .bind(unit.last_accessed_at.map(|t| t.timestamp()))
        .bind(unit.importance)
        .bind(unit.access_count as i64)
        .bind(unit.unit_type.as_i64())
        .bind(&unit.content_hash)
        .bind(serde_json::to_string(&unit.topics).unwrap_or_default())
        .bind(serde_json::to_string(&unit.entities).unwrap_or_default())
        .bind(serde_json::to_string(&unit.metadata).unwrap_or_default())
        .bind(unit.is_deleted as i64)
        .bind(unit.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found(format!("memory {}", unit.id)));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MemoryResult<Option<MemoryUnit>> {
        let row = sqlx::query("SELECT * FROM memory_units WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(MemoryError::from)?;
        row.as_ref().map(Self::row_to_unit).transpose()
    }

    async fn get_many(&self, ids: &[Uuid]) -> MemoryResult<Vec<MemoryUnit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT * FROM memory_units WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.to_string());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(MemoryError::from)?;
        rows.iter().map(Self::row_to_unit).collect()
    }

    async fn soft_delete(&self, id: Uuid) -> MemoryResult<()> {
        let result = sqlx::query(
            "UPDATE memory_units SET is_deleted = 1, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found(format!("memory {id}")));
        }
        Ok(())
    }

    async fn hard_delete(&self, id: Uuid) -> MemoryResult<()> {
        let result = sqlx::query("DELETE FROM memory_units WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(MemoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found(format!("memory {id}")));
        }
        Ok(())
    }

    async fn scan_for_vector_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        self.scan(filter).await
    }

    async fn scan_for_text_search(&self, filter: &MemoryFilter) -> MemoryResult<Vec<MemoryUnit>> {
        self.scan(filter).await
    }

    async fn search(
        &self,
        query_vec: &[f32],
        filter: &MemoryFilter,
        limit: usize,
        min_score: f32,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        let candidates = self.scan(filter).await?;
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

    async fn fts(
        &self,
        query: &str,
        filter: &MemoryFilter,
        limit: usize,
    ) -> MemoryResult<Vec<(MemoryUnit, f32)>> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let overfetch = (limit as i64 * 4).max(limit as i64);
        let rows = sqlx::query(
            r#"
            SELECT m.*, bm25(memory_units_fts) AS rank
            FROM memory_units_fts
            JOIN memory_units m ON m.rowid = memory_units_fts.rowid
            WHERE memory_units_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(overfetch)
        .fetch_all(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            let unit = Self::row_to_unit(row)?;
            if !filter.matches(&unit) {
                continue;
            }
            let raw: f64 = row.try_get("rank").map_err(MemoryError::from)?;
            scored.push((unit, (1.0 / (1.0 + raw.abs())) as f32));
        }
        scored.truncate(limit);
        Ok(scored)
    }

    async fn touch(&self, id: Uuid, now: DateTime<Utc>) -> MemoryResult<()> {
        let result = sqlx::query(
            "UPDATE memory_units SET access_count = access_count + 1, last_accessed_at = ? WHERE id = ?",
        )
        .bind(now.timestamp())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(MemoryError::from)?;

        if result.rows_affected() == 0 {
            return Err(MemoryError::not_found(format!("memory {id}")));
        }
        Ok(())
    }

    async fn count(&self, filter: &MemoryFilter) -> MemoryResult<u64> {
        Ok(self.scan(filter).await?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryType;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", false, 3).await.unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = store().await;
        let mut unit = MemoryUnit::new("owner", "hello sqlite", MemoryType::Fact);
        unit.embedding = Some(vec![1.0, 2.0, 3.0]);
        let id = unit.id;
        store.insert(unit).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "hello sqlite");
        assert_eq!(fetched.embedding, Some(vec![1.0, 2.0, 3.0]));
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let store = store().await;
        let unit = MemoryUnit::new("owner", "hello", MemoryType::Fact);
        store.insert(unit.clone()).await.unwrap();
        let err = store.insert(unit).await.unwrap_err();
        assert!(matches!(err, MemoryError::Conflict { .. }));
    }

    #[tokio::test]
    async fn soft_delete_then_scan_excludes_it() {
        let store = store().await;
        let unit = MemoryUnit::new("owner", "hello", MemoryType::Fact);
        let id = unit.id;
        store.insert(unit).await.unwrap();
        store.soft_delete(id).await.unwrap();

        let results = store
            .scan_for_vector_search(&MemoryFilter::for_owner("owner"))
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn touch_increments_access_count() {
        let store = store().await;
        let unit = MemoryUnit::new("owner", "hello", MemoryType::Fact);
        let id = unit.id;
        store.insert(unit).await.unwrap();
        store.touch(id, Utc::now()).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.access_count, 1);
    }

    #[tokio::test]
    async fn insert_rejects_mismatched_embedding_dimension() {
        let store = store().await;
        let mut unit = MemoryUnit::new("owner", "hello", MemoryType::Fact);
        unit.embedding = Some(vec![1.0, 2.0]);
        let id = unit.id;
        let err = store.insert(unit).await.unwrap_err();
        assert!(matches!(err, MemoryError::Shape { expected: 3, actual: 2 }));
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_many_returns_only_present_ids() {
        let store = store().await;
        let a = MemoryUnit::new("owner", "a", MemoryType::Fact);
        let b = MemoryUnit::new("owner", "b", MemoryType::Fact);
        let (a_id, b_id) = (a.id, b.id);
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();
        let missing = Uuid::new_v4();
        let fetched = store.get_many(&[a_id, missing, b_id]).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn search_ranks_by_cosine() {
        let store = store().await;
        let mut a = MemoryUnit::new("owner", "a", MemoryType::Fact);
        a.embedding = Some(vec![1.0, 0.0, 0.0]);
        let mut b = MemoryUnit::new("owner", "b", MemoryType::Fact);
        b.embedding = Some(vec![0.0, 1.0, 0.0]);
        let a_id = a.id;
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        let results = store
            .search(&[1.0, 0.0, 0.0], &MemoryFilter::for_owner("owner"), 5, 0.5)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, a_id);
    }

    #[tokio::test]
    async fn fts_matches_via_fts5_index() {
        let store = store().await;
        let a = MemoryUnit::new("owner", "React Node Mongo stack", MemoryType::Fact);
        let b = MemoryUnit::new("owner", "completely unrelated", MemoryType::Fact);
        let a_id = a.id;
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();

        let results = store
            .fts("Node stack", &MemoryFilter::for_owner("owner"), 5)
            .await
            .unwrap();
        assert_eq!(results[0].0.id, a_id);
    }
}
