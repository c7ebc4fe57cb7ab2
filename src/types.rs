// src/types.rs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Closed set of memory kinds a unit can be classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Procedural,
    Fact,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Episodic => "episodic",
            MemoryType::Semantic => "semantic",
            MemoryType::Procedural => "procedural",
            MemoryType::Fact => "fact",
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(MemoryType::Episodic),
            1 => Some(MemoryType::Semantic),
            2 => Some(MemoryType::Procedural),
            3 => Some(MemoryType::Fact),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            MemoryType::Episodic => 0,
            MemoryType::Semantic => 1,
            MemoryType::Procedural => 2,
            MemoryType::Fact => 3,
        }
    }
}

/// A single stored memory: identity, content, embedding, and the bookkeeping
/// fields the scoring and duplicate-detection passes read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub id: Uuid,
    pub owner: String,
    pub session_id: Option<Uuid>,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub importance: f32,
    pub access_count: u64,
    pub unit_type: MemoryType,
    pub content_hash: String,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub is_deleted: bool,
}

impl MemoryUnit {
    /// Build a freshly-minted unit. `content_hash` is computed from `content`;
    /// callers should not construct one by hand.
    pub fn new(owner: impl Into<String>, content: impl Into<String>, unit_type: MemoryType) -> Self {
        let now = Utc::now();
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            session_id: None,
            content,
            embedding: None,
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
            importance: 0.5,
            access_count: 0,
            unit_type,
            content_hash,
            topics: Vec::new(),
            entities: Vec::new(),
            metadata: HashMap::new(),
            is_deleted: false,
        }
    }

    /// Clamp importance into `[0, 1]` (invariant I6).
    pub fn clamp_importance(&mut self) {
        self.importance = self.importance.clamp(0.0, 1.0);
    }

    /// Replace content, recomputing the hash; embedding must be refreshed by the caller.
    pub fn set_content(&mut self, content: impl Into<String>) {
        let content = content.into();
        self.content_hash = content_hash(&content);
        self.content = content;
        self.updated_at = Utc::now();
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f32 {
        let anchor = self.last_accessed_at.unwrap_or(self.created_at);
        (now - anchor).num_seconds().max(0) as f32 / 3600.0
    }
}

/// Pure function of content bytes to a hex-encoded SHA-256 digest (invariant I2).
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Which retrieval path(s) surfaced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Dense,
    Sparse,
    Hybrid,
}

/// A `MemoryUnit` paired with a relevance score. Immutable after construction.
#[derive(Debug, Clone)]
pub struct MemorySearchResult {
    pub unit: MemoryUnit,
    pub score: f32,
    pub source: ResultSource,
}

impl MemorySearchResult {
    pub fn new(unit: MemoryUnit, score: f32, source: ResultSource) -> Self {
        Self { unit, score, source }
    }
}

/// Conversation boundary memories can be grouped under. The retrieval core
/// only ever treats a session as an opaque filter key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner: String,
    pub turn_count: u64,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            turn_count: 0,
            last_activity: Utc::now(),
        }
    }
}

/// Structural filter applied by every store backend before scoring.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub owner: Option<String>,
    pub session_id: Option<Uuid>,
    pub unit_types: Option<Vec<MemoryType>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub include_deleted: bool,
}

impl MemoryFilter {
    pub fn for_owner(owner: impl Into<String>) -> Self {
        Self {
            owner: Some(owner.into()),
            ..Default::default()
        }
    }

    /// Whether `unit` satisfies every structural predicate in this filter.
    pub fn matches(&self, unit: &MemoryUnit) -> bool {
        if !self.include_deleted && unit.is_deleted {
            return false;
        }
        if let Some(ref owner) = self.owner {
            if &unit.owner != owner {
                return false;
            }
        }
        if let Some(session_id) = self.session_id {
            if unit.session_id != Some(session_id) {
                return false;
            }
        }
        if let Some(ref types) = self.unit_types {
            if !types.contains(&unit.unit_type) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if unit.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if unit.created_at > before {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_pure() {
        let a = content_hash("hello world");
        let b = content_hash("hello world");
        assert_eq!(a, b);
        assert_ne!(a, content_hash("hello worlds"));
    }

    #[test]
    fn new_unit_has_matching_hash() {
        let unit = MemoryUnit::new("owner", "some content", MemoryType::Fact);
        assert_eq!(unit.content_hash, content_hash("some content"));
        assert_eq!(unit.created_at, unit.updated_at);
    }

    #[test]
    fn filter_excludes_deleted_by_default() {
        let mut unit = MemoryUnit::new("owner", "x", MemoryType::Episodic);
        unit.is_deleted = true;
        let filter = MemoryFilter::for_owner("owner");
        assert!(!filter.matches(&unit));

        let filter_incl = MemoryFilter {
            include_deleted: true,
            ..MemoryFilter::for_owner("owner")
        };
        assert!(filter_incl.matches(&unit));
    }
}
