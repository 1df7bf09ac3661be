//! Core domain logic for PhaseGraph.
//!
//! This crate ties together the per-phase graph store, incremental issue
//! detection, the issue queue and router, status reporting, and bridge
//! compression behind the [`Engine`] facade.

pub mod bridge;
pub mod detector;
pub mod engine;
pub mod graph;
pub mod notify;
pub mod queue;
pub mod router;

pub use bridge::{compress, compress_dual, rank_nodes};
pub use detector::{DetectionDelta, Detector};
pub use engine::{Engine, HandoffRequest, HandoffTarget, IssueFilter, MutationOutcome, Quarantine};
pub use graph::Graph;
pub use notify::{StatusDocument, format_notification};
pub use queue::{IssueQueue, IssueSummary};
pub use router::{Assignment, Router};
