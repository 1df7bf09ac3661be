//! Error types for PhaseGraph.
//!
//! Library crates use [`PhaseGraphError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Every variant names the invariant it guards and carries the identifiers
//! involved, so callers never have to guess which node or file failed.

use std::path::PathBuf;

/// Top-level error type for all PhaseGraph operations.
#[derive(Debug, thiserror::Error)]
pub enum PhaseGraphError {
    /// A node with this id already exists in the phase graph.
    #[error("duplicate node id '{node_id}' in phase '{phase}': node ids must be unique per graph")]
    DuplicateId { phase: String, node_id: String },

    /// The referenced node does not exist in the phase graph.
    #[error("node '{node_id}' not found in phase '{phase}'")]
    NotFound { phase: String, node_id: String },

    /// The referenced phase has no graph (or is quarantined).
    #[error("phase '{phase}' not found")]
    PhaseNotFound { phase: String },

    /// A confidence value fell outside `[0, 1]`.
    #[error(
        "invalid confidence {value} for node '{node_id}' in phase '{phase}': confidence must lie in [0, 1]"
    )]
    InvalidConfidence {
        phase: String,
        node_id: String,
        value: f64,
    },

    /// An edge endpoint does not reference an existing node.
    #[error(
        "dangling reference in phase '{phase}': edge {source_id} -> {target_id} references missing node '{missing}'"
    )]
    DanglingReference {
        phase: String,
        source_id: String,
        target_id: String,
        missing: String,
    },

    /// The resolver routing table has no entry for this issue type.
    #[error("unknown issue type '{issue_type}': no resolver is routed for it")]
    UnknownIssueType { issue_type: String },

    /// A persisted document could not be parsed.
    #[error("corrupt persisted file {path:?}: {reason}")]
    CorruptPersistedFile { path: PathBuf, reason: String },

    /// The phase graph is archived and no longer accepts mutations.
    #[error("phase '{phase}' is archived: archived graphs are read-only")]
    Archived { phase: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Data validation error (schema mismatch, invalid request, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PhaseGraphError>;

impl PhaseGraphError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a corrupt-file error for a document that failed to parse.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptPersistedFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a missing node in a phase.
    pub fn not_found(phase: &str, node_id: &str) -> Self {
        Self::NotFound {
            phase: phase.to_string(),
            node_id: node_id.to_string(),
        }
    }

    /// Whether this error is a write-side I/O failure worth one retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PhaseGraphError::config("missing data_dir");
        assert_eq!(err.to_string(), "config error: missing data_dir");

        let err = PhaseGraphError::validation("schema_version 99 not supported");
        assert!(err.to_string().contains("schema_version 99"));
    }

    #[test]
    fn errors_name_the_identifiers_involved() {
        let err = PhaseGraphError::DanglingReference {
            phase: "research".into(),
            source_id: "a".into(),
            target_id: "ghost".into(),
            missing: "ghost".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("research"));
        assert!(msg.contains("a -> ghost"));
        assert!(msg.contains("missing node 'ghost'"));

        let err = PhaseGraphError::InvalidConfidence {
            phase: "p".into(),
            node_id: "n1".into(),
            value: 1.5,
        };
        assert!(err.to_string().contains("1.5"));
        assert!(err.to_string().contains("[0, 1]"));
    }

    #[test]
    fn only_io_errors_are_retryable() {
        let io = PhaseGraphError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(io.is_retryable());
        assert!(!PhaseGraphError::not_found("p", "n").is_retryable());
    }
}
