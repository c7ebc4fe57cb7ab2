//! Hybrid vector + lexical long-term memory engine for conversational agents.
//!
//! The retrieval core is organized as a small set of synchronous, pure
//! components (`vector_math`, `tokenizer`, `bm25`, `scoring`, `duplicate`,
//! `context`) wired together by the async `service::MemoryService`, which is
//! the only place that crosses an I/O boundary (the store and the embedding
//! provider).

pub mod bm25;
pub mod config;
pub mod context;
pub mod duplicate;
pub mod embedding;
pub mod error;
pub mod scoring;
pub mod search;
pub mod service;
pub mod store;
pub mod tokenizer;
pub mod types;
pub mod vector_math;

pub use config::MemoryCoreConfig;
pub use duplicate::{DuplicatePolicy, DuplicateVerdict, MergeStrategy};
pub use error::{MemoryError, MemoryResult};
pub use service::{MemoryService, RecallOutcome, RememberOutcome};
pub use types::{MemoryFilter, MemorySearchResult, MemoryType, MemoryUnit, ResultSource, Session};
