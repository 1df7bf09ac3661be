//! Per-phase knowledge graph store.
//!
//! A [`Graph`] owns a keyed set of nodes and a multiset of directed edges.
//! Mutations validate first and apply second, so a rejected call leaves the
//! graph exactly as it was. Nodes are never deleted; every successful
//! mutation is appended to the graph's audit log.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use phasegraph_shared::{
    CURRENT_SCHEMA_VERSION, Edge, MutationKind, MutationRecord, Node, NodePatch, PhaseGraphError,
    Result, is_valid_confidence,
};

/// One phase's knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GraphDocument", into = "GraphDocument")]
pub struct Graph {
    phase: String,
    archived_at: Option<DateTime<Utc>>,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    mutation_log: Vec<MutationRecord>,
}

impl Graph {
    /// Create an empty graph for `phase`.
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            archived_at: None,
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            mutation_log: Vec::new(),
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn archived_at(&self) -> Option<DateTime<Utc>> {
        self.archived_at
    }

    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn mutation_log(&self) -> &[MutationRecord] {
        &self.mutation_log
    }

    /// Undirected degree of every node that has at least one edge.
    pub fn degrees(&self) -> HashMap<&str, usize> {
        let mut degrees = HashMap::new();
        for edge in &self.edges {
            *degrees.entry(edge.source.as_str()).or_insert(0) += 1;
            *degrees.entry(edge.target.as_str()).or_insert(0) += 1;
        }
        degrees
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert a new node. Fails on a duplicate id or out-of-range confidence.
    pub fn add_node(&mut self, node: Node) -> Result<MutationRecord> {
        self.ensure_writable()?;
        if self.nodes.contains_key(&node.id) {
            return Err(PhaseGraphError::DuplicateId {
                phase: self.phase.clone(),
                node_id: node.id,
            });
        }
        if !is_valid_confidence(node.confidence) {
            return Err(PhaseGraphError::InvalidConfidence {
                phase: self.phase.clone(),
                node_id: node.id,
                value: node.confidence,
            });
        }

        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        debug!(phase = %self.phase, node_id = %id, "node added");
        Ok(self.record(MutationKind::AddNode, id))
    }

    /// Patch an existing node in place.
    ///
    /// Properties are merged by key, evidence is appended (skipping citations
    /// already present), and `updated_at` is bumped.
    pub fn update_node(&mut self, id: &str, patch: NodePatch) -> Result<MutationRecord> {
        self.ensure_writable()?;
        let phase = self.phase.clone();
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| PhaseGraphError::not_found(&phase, id))?;

        if let Some(value) = patch.confidence {
            if !is_valid_confidence(value) {
                return Err(PhaseGraphError::InvalidConfidence {
                    phase,
                    node_id: id.to_string(),
                    value,
                });
            }
        }

        if let Some(label) = patch.label {
            node.label = label;
        }
        if let Some(description) = patch.description {
            node.description = description;
        }
        node.properties.extend(patch.properties);
        if let Some(value) = patch.confidence {
            node.confidence = value;
        }
        for citation in patch.evidence {
            if !node.evidence.contains(&citation) {
                node.evidence.push(citation);
            }
        }
        node.updated_at = Utc::now().max(node.updated_at);

        debug!(phase = %self.phase, node_id = %id, "node updated");
        Ok(self.record(MutationKind::UpdateNode, id.to_string()))
    }

    /// Append a directed edge. Both endpoints must already exist.
    pub fn add_edge(&mut self, edge: Edge) -> Result<MutationRecord> {
        self.ensure_writable()?;
        for endpoint in [&edge.source, &edge.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(PhaseGraphError::DanglingReference {
                    phase: self.phase.clone(),
                    source_id: edge.source.clone(),
                    target_id: edge.target.clone(),
                    missing: endpoint.clone(),
                });
            }
        }

        let subject = format!("{}->{}", edge.source, edge.target);
        debug!(phase = %self.phase, edge = %subject, relation = %edge.relation, "edge added");
        self.edges.push(edge);
        Ok(self.record(MutationKind::AddEdge, subject))
    }

    /// Mark the graph read-only once its phase has completed.
    pub fn archive(&mut self) -> Result<MutationRecord> {
        self.ensure_writable()?;
        self.archived_at = Some(Utc::now());
        Ok(self.record(MutationKind::Archive, self.phase.clone()))
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_archived() {
            return Err(PhaseGraphError::Archived {
                phase: self.phase.clone(),
            });
        }
        Ok(())
    }

    fn record(&mut self, kind: MutationKind, subject: String) -> MutationRecord {
        let seq = self.mutation_log.last().map_or(1, |r| r.seq + 1);
        let record = MutationRecord {
            seq,
            at: Utc::now(),
            kind,
            subject,
        };
        self.mutation_log.push(record.clone());
        record
    }
}

// ---------------------------------------------------------------------------
// Persisted form
// ---------------------------------------------------------------------------

/// On-disk layout of `graph.json`: a node collection plus a link collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphDocument {
    schema_version: u32,
    phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    archived_at: Option<DateTime<Utc>>,
    nodes: Vec<Node>,
    #[serde(default)]
    links: Vec<Edge>,
    #[serde(default)]
    mutation_log: Vec<MutationRecord>,
}

impl From<Graph> for GraphDocument {
    fn from(graph: Graph) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            phase: graph.phase,
            archived_at: graph.archived_at,
            nodes: graph.nodes.into_values().collect(),
            links: graph.edges,
            mutation_log: graph.mutation_log,
        }
    }
}

impl TryFrom<GraphDocument> for Graph {
    type Error = String;

    fn try_from(doc: GraphDocument) -> std::result::Result<Self, Self::Error> {
        if doc.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version: {} (expected {CURRENT_SCHEMA_VERSION})",
                doc.schema_version
            ));
        }

        let mut nodes = BTreeMap::new();
        for node in doc.nodes {
            if !is_valid_confidence(node.confidence) {
                return Err(format!(
                    "node '{}' has confidence {} outside [0, 1]",
                    node.id, node.confidence
                ));
            }
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(format!("duplicate node id '{id}'"));
            }
        }
        for edge in &doc.links {
            if let Some(missing) = [&edge.source, &edge.target]
                .into_iter()
                .find(|id| !nodes.contains_key(*id))
            {
                return Err(format!(
                    "link {} -> {} references missing node '{missing}'",
                    edge.source, edge.target
                ));
            }
        }

        Ok(Self {
            phase: doc.phase,
            archived_at: doc.archived_at,
            nodes,
            edges: doc.links,
            mutation_log: doc.mutation_log,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
