//! Duplicate detection: exact via content hash, near-duplicate via cosine
//! similarity threshold over embeddings.

use crate::types::MemoryUnit;
use crate::vector_math;

/// Outcome of checking a candidate against an existing corpus.
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateVerdict {
    /// No existing unit is close enough to be considered a duplicate.
    Unique,
    /// Byte-identical content (same SHA-256 hash).
    ExactDuplicate { existing_id: uuid::Uuid },
    /// Cosine similarity to an existing embedding exceeds the threshold.
    NearDuplicate {
        existing_id: uuid::Uuid,
        similarity: f32,
    },
}

/// What to do when `check` reports an `ExactDuplicate` or `NearDuplicate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Discard the incoming unit, returning the existing id untouched.
    Skip,
    /// Replace the existing unit's content wholesale with the incoming one.
    UpdateExisting,
    /// Combine the two units per `MergeStrategy`.
    Merge(MergeStrategy),
    /// Ignore the match and store the incoming unit as a brand new row.
    StoreAnyway,
}

/// How to reconcile fields when two units are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    KeepOldest,
    KeepNewest,
    KeepMostAccessed,
    KeepHighestImportance,
    /// Prefer whichever content is newer, union topics/entities/metadata,
    /// sum access counts, keep the maximum importance.
    CombineContent,
}

/// Stateless detector parameterized by the near-duplicate cosine threshold.
#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    pub similarity_threshold: f32,
}

impl DuplicateDetector {
    pub fn new(similarity_threshold: f32) -> Self {
        Self {
            similarity_threshold,
        }
    }

    /// Check `candidate` (hash + optional embedding) against `existing`.
    /// Exact-hash matches take priority over near-duplicate matches; among
    /// near-duplicates, the highest similarity wins.
    pub fn check(&self, candidate: &MemoryUnit, existing: &[MemoryUnit]) -> DuplicateVerdict {
        for unit in existing {
            if unit.id == candidate.id {
                continue;
            }
            if unit.content_hash == candidate.content_hash {
                return DuplicateVerdict::ExactDuplicate {
                    existing_id: unit.id,
                };
            }
        }

        let mut best: Option<(uuid::Uuid, f32)> = None;
        if let Some(candidate_emb) = candidate.embedding.as_deref() {
            for unit in existing {
                if unit.id == candidate.id {
                    continue;
                }
                let Some(emb) = unit.embedding.as_deref() else {
                    continue;
                };
                let Ok(sim) = vector_math::cosine(candidate_emb, emb) else {
                    continue;
                };
                if sim >= self.similarity_threshold {
                    match best {
                        Some((_, best_sim)) if best_sim >= sim => {}
                        _ => best = Some((unit.id, sim)),
                    }
                }
            }
        }

        match best {
            Some((existing_id, similarity)) => DuplicateVerdict::NearDuplicate {
                existing_id,
                similarity,
            },
            None => DuplicateVerdict::Unique,
        }
    }

    /// Merge `incoming` into `existing` per `strategy`. The surviving unit
    /// always keeps `existing`'s id; access counts are always summed and
    /// topics/entities/metadata always union, regardless of strategy —
    /// `strategy` only decides which side's content and importance win.
    pub fn merge(&self, existing: &MemoryUnit, incoming: &MemoryUnit, strategy: MergeStrategy) -> MemoryUnit {
        let keep_incoming_content = match strategy {
            MergeStrategy::KeepOldest => false,
            MergeStrategy::KeepNewest => true,
            MergeStrategy::CombineContent => incoming.updated_at >= existing.updated_at,
            MergeStrategy::KeepMostAccessed => incoming.access_count > existing.access_count,
            MergeStrategy::KeepHighestImportance => incoming.importance > existing.importance,
        };

        let mut merged = if keep_incoming_content {
            incoming.clone()
        } else {
            existing.clone()
        };
        merged.id = existing.id;

        let mut topics = existing.topics.clone();
        for t in &incoming.topics {
            if !topics.contains(t) {
                topics.push(t.clone());
            }
        }
        merged.topics = topics;

        let mut entities = existing.entities.clone();
        for e in &incoming.entities {
            if !entities.contains(e) {
                entities.push(e.clone());
            }
        }
        merged.entities = entities;

        let mut metadata = existing.metadata.clone();
        metadata.extend(incoming.metadata.clone());
        merged.metadata = metadata;

        merged.access_count = existing.access_count + incoming.access_count;
        merged.importance = existing.importance.max(incoming.importance);
        merged
    }
}
