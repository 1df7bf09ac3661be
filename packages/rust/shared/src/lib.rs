//! Shared types, error model, and configuration for PhaseGraph.
//!
//! This crate is the foundation depended on by all other PhaseGraph crates.
//! It provides:
//! - [`PhaseGraphError`]: the unified error type
//! - Domain types ([`Node`], [`Edge`], [`Issue`], [`BridgeArtifact`])
//! - Configuration ([`AppConfig`], [`DetectorConfig`], [`WeightProfile`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_PROFILE, DefaultsConfig, DetectorConfig, PersistenceConfig, RuleCondition,
    RuleSpec, WeightProfile, config_dir, config_file_path, init_config, load_config,
    load_config_from,
};
pub use error::{PhaseGraphError, Result};
pub use types::{
    BridgeArtifact, BridgeNode, BridgeWarning, CURRENT_SCHEMA_VERSION, Edge, Issue, IssueType,
    MutationKind, MutationRecord, Node, NodePatch, NodeType, Severity, is_valid_confidence,
};
