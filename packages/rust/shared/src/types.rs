//! Core domain types for PhaseGraph knowledge graphs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for every persisted document.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// NodeType
// ---------------------------------------------------------------------------

/// Kind of knowledge a node carries. Unknown strings are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeType {
    Entity,
    Concept,
    Decision,
    Finding,
    /// A known-unknown; exempt from confidence/evidence rules.
    Uncertainty,
    Task,
    Other(String),
}

impl NodeType {
    /// Canonical string form (also the serialized form).
    pub fn as_str(&self) -> &str {
        match self {
            Self::Entity => "Entity",
            Self::Concept => "Concept",
            Self::Decision => "Decision",
            Self::Finding => "Finding",
            Self::Uncertainty => "Uncertainty",
            Self::Task => "Task",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for NodeType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Entity" => Self::Entity,
            "Concept" => Self::Concept,
            "Decision" => Self::Decision,
            "Finding" => Self::Finding,
            "Uncertainty" => Self::Uncertainty,
            "Task" => Self::Task,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for NodeType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<NodeType> for String {
    fn from(t: NodeType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Node / Edge
// ---------------------------------------------------------------------------

/// A typed, evidence-carrying unit of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique id within the owning graph.
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub label: String,
    #[serde(default)]
    pub description: String,
    /// Free-form attributes. Ordered so output and equality are deterministic.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Must lie in `[0, 1]`.
    pub confidence: f64,
    /// Citation strings, in the order they were added.
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Identity of the collaborator that created the node.
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    /// Last patch time (equal to `created_at` for untouched nodes).
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Create a node with empty properties and evidence, timestamped now.
    pub fn new(
        id: impl Into<String>,
        node_type: impl Into<NodeType>,
        label: impl Into<String>,
        confidence: f64,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            node_type: node_type.into(),
            label: label.into(),
            description: String::new(),
            properties: BTreeMap::new(),
            confidence,
            evidence: Vec::new(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Builder-style evidence setter.
    pub fn with_evidence(mut self, citation: impl Into<String>) -> Self {
        self.evidence.push(citation.into());
        self
    }

    /// Builder-style description setter.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Override both timestamps (useful for imports and tests).
    pub fn with_timestamps(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }
}

/// Returns `true` when `value` is a finite number in `[0, 1]`.
pub fn is_valid_confidence(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// In-place changes applied by `update_node`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Merged into the node's properties, overwriting by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Appended to the node's evidence; citations already present are skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.label.is_none()
            && self.description.is_none()
            && self.properties.is_empty()
            && self.confidence.is_none()
            && self.evidence.is_empty()
    }
}

/// A directed, labeled relationship. Parallel edges are permitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub relation: String,
    #[serde(default)]
    pub rationale: String,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            relation: relation.into(),
            rationale: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Issues
// ---------------------------------------------------------------------------

/// Issue severity. Ordered most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::High, Severity::Medium, Severity::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Kind of quality defect. Custom types come from configured rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum IssueType {
    SparseEntity,
    LowConfidence,
    MissingEvidence,
    Custom(String),
}

impl IssueType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::SparseEntity => "SparseEntity",
            Self::LowConfidence => "LowConfidence",
            Self::MissingEvidence => "MissingEvidence",
            Self::Custom(s) => s,
        }
    }
}

impl From<String> for IssueType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SparseEntity" => Self::SparseEntity,
            "LowConfidence" => Self::LowConfidence,
            "MissingEvidence" => Self::MissingEvidence,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for IssueType {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<IssueType> for String {
    fn from(t: IssueType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected quality problem tied to one node of one phase graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub node_id: String,
    /// Owning graph.
    pub phase: String,
    pub severity: Severity,
    /// Why the rule fired, e.g. "confidence 0.60 below 0.85".
    #[serde(default)]
    pub rationale: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Issue {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Dedup key within a phase queue.
    pub fn key(&self) -> (&str, &IssueType) {
        (self.node_id.as_str(), &self.issue_type)
    }
}

// ---------------------------------------------------------------------------
// Mutation log
// ---------------------------------------------------------------------------

/// Kind of graph mutation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    AddNode,
    UpdateNode,
    AddEdge,
    Archive,
}

/// One entry in a graph's append-only mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub kind: MutationKind,
    /// Node id, or `source->target` for edges.
    pub subject: String,
}

// ---------------------------------------------------------------------------
// Bridge artifacts
// ---------------------------------------------------------------------------

/// A node selected for handoff, with the score it was ranked by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeNode {
    #[serde(flatten)]
    pub node: Node,
    pub score: f64,
    #[serde(default)]
    pub pinned: bool,
}

/// Non-fatal conditions raised while compressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeWarning {
    /// More nodes were pinned than the budget allows; all pins were kept.
    BudgetUnderflow { budget: usize, pinned: usize },
}

impl fmt::Display for BridgeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetUnderflow { budget, pinned } => write!(
                f,
                "budget underflow: {pinned} pinned nodes exceed budget of {budget}"
            ),
        }
    }
}

/// Size-bounded, score-ranked subset of a phase graph handed to the next phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeArtifact {
    pub schema_version: u32,
    pub source_phase: String,
    pub target_phase: String,
    /// Weight profile the nodes were ranked with.
    pub profile: String,
    pub budget: usize,
    pub generated_at: DateTime<Utc>,
    /// Selected nodes in rank order.
    pub nodes: Vec<BridgeNode>,
    /// Edges whose endpoints were both selected, in graph order.
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<BridgeWarning>,
    /// Hex SHA-256 over the selected node ids and edges.
    pub digest: String,
}

impl BridgeArtifact {
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node.id.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_roundtrips_known_and_open_variants() {
        for raw in ["Entity", "Decision", "Uncertainty", "Hypothesis"] {
            let t = NodeType::from(raw);
            let json = serde_json::to_string(&t).expect("serialize");
            assert_eq!(json, format!("\"{raw}\""));
            let parsed: NodeType = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(parsed, t);
        }
        assert_eq!(NodeType::from("Hypothesis"), NodeType::Other("Hypothesis".into()));
    }

    #[test]
    fn node_serializes_type_field() {
        let node = Node::new("n1", NodeType::Entity, "Service", 0.9, "tester")
            .with_property("owner", "team-a")
            .with_evidence("doc://a");
        let value = serde_json::to_value(&node).expect("serialize");
        assert_eq!(value["type"], "Entity");
        assert_eq!(value["properties"]["owner"], "team-a");

        let parsed: Node = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn confidence_bounds() {
        assert!(is_valid_confidence(0.0));
        assert!(is_valid_confidence(1.0));
        assert!(!is_valid_confidence(1.01));
        assert!(!is_valid_confidence(-0.1));
        assert!(!is_valid_confidence(f64::NAN));
    }

    #[test]
    fn severity_orders_high_first() {
        let mut all = vec![Severity::Low, Severity::High, Severity::Medium];
        all.sort();
        assert_eq!(all, Severity::ALL.to_vec());
        assert_eq!("HIGH".parse::<Severity>(), Ok(Severity::High));
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn issue_serialization_uses_lowercase_severity() {
        let issue = Issue {
            issue_type: IssueType::LowConfidence,
            node_id: "n1".into(),
            phase: "research".into(),
            severity: Severity::High,
            rationale: "confidence 0.60 below 0.85".into(),
            detected_at: Utc::now(),
            resolved_at: None,
        };
        let value = serde_json::to_value(&issue).expect("serialize");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["type"], "LowConfidence");
        assert!(value["resolved_at"].is_null());
    }

    #[test]
    fn bridge_node_flattens_node_fields() {
        let bn = BridgeNode {
            node: Node::new("d1", NodeType::Decision, "Ship it", 0.95, "tester"),
            score: 0.75,
            pinned: true,
        };
        let value = serde_json::to_value(&bn).expect("serialize");
        assert_eq!(value["id"], "d1");
        assert_eq!(value["pinned"], true);
        let parsed: BridgeNode = serde_json::from_value(value).expect("deserialize");
        assert_eq!(parsed, bn);
    }
}
