//! Hypergraph Core Library
//!
//! Incremental knowledge-graph indexing over a language-model completion
//! service. This crate provides:
//! - Completion orchestration (cache, rate limiting, retry, metrics middleware)
//! - Graph data model and table storage
//! - Type-label canonicalization and type proposals
//! - Incremental merge of delta graphs into a persisted base graph
//! - Extraction and update workflows run by a sequential pipeline engine

pub mod cache;
pub mod canonical;
pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod llm;
pub mod merge;
pub mod registry;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::Cache;
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::graph::{Community, Entity, Relationship, TableProvider};
    pub use crate::index::{IndexRun, RunMode, build_index};
    pub use crate::llm::{CompletionRequest, CompletionResponse, LlmCompletion, Registries};
    pub use crate::merge::{IdMapping, IncrementalMergeEngine};
}
