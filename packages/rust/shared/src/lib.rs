//! Shared types, error model, and configuration for novelkb.
//!
//! This crate is the foundation depended on by all other novelkb crates.
//! It provides:
//! - [`NovelKbError`]: the unified error type
//! - Domain types ([`Chunk`], [`ExtractionRecord`], [`Character`], [`Relation`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ChunkingConfig, DirectionPolicy, ExtractConfig, LlmConfig, MergeConfig,
    RetryConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    resolve_api_key,
};
pub use error::{NovelKbError, Result};
pub use types::{
    Character, Chunk, EntityMention, EventMention, Evidence, ExtractionPayload,
    ExtractionRecord, FailureKind, FailureReason, ParseStatus, Relation, RelationDirection,
    RelationEvidence, RelationMention,
};
