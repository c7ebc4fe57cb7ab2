// src/config.rs
//! Layered configuration: built-in defaults, overridden by environment
//! variables, optionally overridden again by a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, MemoryResult};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend_kind: String,
    pub connection: String,
    pub collection: String,
    pub dimensions: usize,
    pub wal: bool,
    pub fts_tokenizer: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend_kind: env_or("MNEMO_STORAGE_BACKEND", "sqlite".to_string()),
            connection: env_or("MNEMO_STORAGE_CONNECTION", "sqlite::memory:".to_string()),
            collection: env_or("MNEMO_STORAGE_COLLECTION", "memories".to_string()),
            dimensions: env_or("MNEMO_STORAGE_DIMENSIONS", 1536),
            wal: env_or("MNEMO_STORAGE_WAL", true),
            fts_tokenizer: env_or("MNEMO_STORAGE_FTS_TOKENIZER", "unicode61".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider_id: String,
    pub model: String,
    pub dimensions: usize,
    pub cache_ttl_min: u64,
    pub batch_size: usize,
    pub timeout_s: u64,
    pub max_concurrency: usize,
}

impl EmbeddingConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_min * 60)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider_id: env_or("MNEMO_EMBEDDING_PROVIDER", "default".to_string()),
            model: env_or("MNEMO_EMBEDDING_MODEL", "default".to_string()),
            dimensions: env_or("MNEMO_EMBEDDING_DIMENSIONS", 1536),
            cache_ttl_min: env_or("MNEMO_EMBEDDING_CACHE_TTL_MIN", 60),
            batch_size: env_or("MNEMO_EMBEDDING_BATCH_SIZE", 100),
            timeout_s: env_or("MNEMO_EMBEDDING_TIMEOUT_S", 30),
            max_concurrency: env_or("MNEMO_EMBEDDING_MAX_CONCURRENCY", 1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub alpha: f32,
    pub beta: f32,
    pub gamma: f32,
    pub delta: f32,
    pub decay: f32,
    pub expected_max: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            alpha: env_or("MNEMO_SCORING_ALPHA", 0.3),
            beta: env_or("MNEMO_SCORING_BETA", 0.3),
            gamma: env_or("MNEMO_SCORING_GAMMA", 0.3),
            delta: env_or("MNEMO_SCORING_DELTA", 0.1),
            decay: env_or("MNEMO_SCORING_DECAY", 0.995),
            expected_max: env_or("MNEMO_SCORING_EXPECTED_MAX", 100.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub min_score: f32,
    pub dense_weight: f32,
    pub sparse_weight: f32,
    pub rrf_k: f32,
    pub use_mmr: bool,
    pub mmr_lambda: f32,
    pub dedup_sim_threshold: f32,
    pub use_hyde: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: env_or("MNEMO_SEARCH_DEFAULT_LIMIT", 10),
            min_score: env_or("MNEMO_SEARCH_MIN_SCORE", 0.0),
            dense_weight: env_or("MNEMO_SEARCH_DENSE_WEIGHT", 0.6),
            sparse_weight: env_or("MNEMO_SEARCH_SPARSE_WEIGHT", 0.4),
            rrf_k: env_or("MNEMO_SEARCH_RRF_K", 60.0),
            use_mmr: env_or("MNEMO_SEARCH_USE_MMR", false),
            mmr_lambda: env_or("MNEMO_SEARCH_MMR_LAMBDA", 0.5),
            dedup_sim_threshold: env_or("MNEMO_SEARCH_DEDUP_SIM_THRESHOLD", 0.92),
            use_hyde: env_or("MNEMO_SEARCH_USE_HYDE", false),
        }
    }
}

/// Aggregate configuration for the memory engine. `load()` layers defaults,
/// then environment variables (picked up by each section's `Default` impl),
/// then an optional TOML file on top.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCoreConfig {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub scoring: ScoringConfig,
    pub search: SearchConfig,
}

impl MemoryCoreConfig {
    /// Defaults plus environment overrides, with no file layer.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// `from_env()` further overridden by `path`, if it exists.
    pub fn load(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref();
        let base = Self::from_env();
        if !path.exists() {
            return Ok(base);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| MemoryError::invalid_argument(format!("reading {path:?}: {e}")))?;
        let overrides: MemoryCoreConfigFile = toml::from_str(&text)
            .map_err(|e| MemoryError::invalid_argument(format!("parsing {path:?}: {e}")))?;
        Ok(overrides.apply_over(base))
    }
}

/// Partial TOML representation: every field optional so a config file only
/// needs to name what it overrides.
#[derive(Debug, Default, Deserialize)]
struct MemoryCoreConfigFile {
    storage: Option<toml::Value>,
    embedding: Option<toml::Value>,
    scoring: Option<toml::Value>,
    search: Option<toml::Value>,
}

impl MemoryCoreConfigFile {
    fn apply_over(self, mut base: MemoryCoreConfig) -> MemoryCoreConfig {
        if let Some(v) = self.storage {
            if let Ok(s) = v.try_into() {
                base.storage = s;
            }
        }
        if let Some(v) = self.embedding {
            if let Ok(e) = v.try_into() {
                base.embedding = e;
            }
        }
        if let Some(v) = self.scoring {
            if let Ok(s) = v.try_into() {
                base.scoring = s;
            }
        }
        if let Some(v) = self.search {
            if let Ok(s) = v.try_into() {
                base.search = s;
            }
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = MemoryCoreConfig::default();
        assert_eq!(cfg.scoring.decay, 0.995);
        assert_eq!(cfg.search.rrf_k, 60.0);
        assert_eq!(cfg.search.dense_weight, 0.6);
        assert_eq!(cfg.search.sparse_weight, 0.4);
    }

    #[test]
    fn load_with_missing_file_falls_back_to_env_defaults() {
        let cfg = MemoryCoreConfig::load("/nonexistent/path/mnemo.toml").unwrap();
        assert_eq!(cfg.scoring.alpha, 0.3);
    }

    #[test]
    fn load_applies_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mnemo.toml");
        std::fs::write(&path, "[scoring]\nalpha = 0.9\n").unwrap();
        let cfg = MemoryCoreConfig::load(&path).unwrap();
        assert_eq!(cfg.scoring.alpha, 0.9);
        // Unset sections keep their defaults.
        assert_eq!(cfg.search.rrf_k, 60.0);
    }
}
