//! Bridge compressor: deterministic, budgeted selection of the most important
//! nodes of a phase graph for handoff to the next phase.
//!
//! Compression is a pure function of `(graph, budget, profile, pins)`. It
//! reads a snapshot and never mutates it, so the dual-output variant is just
//! two independent calls with different weight profiles.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use phasegraph_shared::{
    BridgeArtifact, BridgeNode, BridgeWarning, CURRENT_SCHEMA_VERSION, Edge, Node,
    PhaseGraphError, Result, WeightProfile,
};
use phasegraph_storage::FileStore;

use crate::graph::Graph;

/// A node with its computed score, before selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNode<'a> {
    pub node: &'a Node,
    pub score: f64,
}

/// Score every node of `graph` under `profile` and rank them.
///
/// Ordering: score descending, then earlier `created_at`, then id.
pub fn rank_nodes<'a>(graph: &'a Graph, profile: &WeightProfile) -> Vec<ScoredNode<'a>> {
    let Some(reference) = graph.nodes().map(|n| n.updated_at).max() else {
        return Vec::new();
    };
    let degrees = graph.degrees();
    let max_degree = degrees.values().copied().max().unwrap_or(0);

    let mut ranked: Vec<ScoredNode<'a>> = graph
        .nodes()
        .map(|node| {
            let age_hours =
                (reference - node.updated_at).num_milliseconds().max(0) as f64 / 3_600_000.0;
            let recency = 0.5f64.powf(age_hours / profile.recency_half_life_hours);
            let connectivity = if max_degree == 0 {
                0.0
            } else {
                degrees.get(node.id.as_str()).copied().unwrap_or(0) as f64 / max_degree as f64
            };
            let score = profile.type_weight * profile.priority_of(&node.node_type)
                + profile.recency_weight * recency
                + profile.connectivity_weight * connectivity
                + profile.confidence_weight * node.confidence;
            ScoredNode { node, score }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.node.created_at.cmp(&b.node.created_at))
            .then_with(|| a.node.id.cmp(&b.node.id))
    });
    ranked
}

/// Select at most `budget` nodes (plus any pins beyond it) from `graph` for
/// `target_phase`, keeping only edges whose endpoints both survive.
#[instrument(skip_all, fields(source = %graph.phase(), target = target_phase, budget = budget, profile = %profile.name))]
pub fn compress(
    graph: &Graph,
    target_phase: &str,
    budget: usize,
    profile: &WeightProfile,
    pins: &[String],
) -> Result<BridgeArtifact> {
    profile.validate()?;

    let pinned: BTreeSet<&str> = pins.iter().map(String::as_str).collect();
    if let Some(missing) = pinned.iter().find(|id| graph.node(id).is_none()) {
        return Err(PhaseGraphError::not_found(graph.phase(), missing));
    }

    let mut warnings = Vec::new();
    if pinned.len() > budget {
        warn!(pinned = pinned.len(), "pinned nodes exceed handoff budget");
        warnings.push(BridgeWarning::BudgetUnderflow {
            budget,
            pinned: pinned.len(),
        });
    }

    let mut free_slots = budget.saturating_sub(pinned.len());
    let nodes: Vec<BridgeNode> = rank_nodes(graph, profile)
        .into_iter()
        .filter(|scored| {
            if pinned.contains(scored.node.id.as_str()) {
                true
            } else if free_slots > 0 {
                free_slots -= 1;
                true
            } else {
                false
            }
        })
        .map(|scored| BridgeNode {
            pinned: pinned.contains(scored.node.id.as_str()),
            node: scored.node.clone(),
            score: scored.score,
        })
        .collect();

    let selected: HashSet<&str> = nodes.iter().map(|n| n.node.id.as_str()).collect();
    let edges: Vec<Edge> = graph
        .edges()
        .iter()
        .filter(|e| selected.contains(e.source.as_str()) && selected.contains(e.target.as_str()))
        .cloned()
        .collect();

    let digest = digest(&nodes, &edges);
    debug!(
        selected = nodes.len(),
        edges = edges.len(),
        of = graph.node_count(),
        "bridge selection complete"
    );

    Ok(BridgeArtifact {
        schema_version: CURRENT_SCHEMA_VERSION,
        source_phase: graph.phase().to_string(),
        target_phase: target_phase.to_string(),
        profile: profile.name.clone(),
        budget,
        generated_at: Utc::now(),
        nodes,
        edges,
        warnings,
        digest,
    })
}

/// Feed two downstream phases from one snapshot, each with its own profile.
pub fn compress_dual(
    graph: &Graph,
    budget: usize,
    pins: &[String],
    first: (&str, &WeightProfile),
    second: (&str, &WeightProfile),
) -> Result<(BridgeArtifact, BridgeArtifact)> {
    let a = compress(graph, first.0, budget, first.1, pins)?;
    let b = compress(graph, second.0, budget, second.1, pins)?;
    Ok((a, b))
}

/// Atomically write `artifact` to `bridges/<source>--<target>.json`.
pub fn write_bridge(store: &FileStore, artifact: &BridgeArtifact) -> Result<PathBuf> {
    let path = store.bridge_path(&artifact.source_phase, &artifact.target_phase)?;
    store.write_json(&path, artifact)?;
    info!(
        path = %path.display(),
        nodes = artifact.nodes.len(),
        digest = %artifact.digest,
        "bridge artifact written"
    );
    Ok(path)
}

/// Hex SHA-256 over the ranked node ids and the retained edges.
fn digest(nodes: &[BridgeNode], edges: &[Edge]) -> String {
    let mut hasher = Sha256::new();
    for n in nodes {
        hasher.update(n.node.id.as_bytes());
        hasher.update([0]);
    }
    hasher.update([0xff]);
    for e in edges {
        for part in [&e.source, &e.relation, &e.target] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
    }
    format!("{:x}", hasher.finalize())
}
