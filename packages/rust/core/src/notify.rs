//! Issue digests and the regenerated status document.
//!
//! [`format_notification`] and [`build_status_document`] are pure; only
//! [`write_status_document`] touches the filesystem, through the store's
//! write-temp-then-rename path.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use phasegraph_shared::{CURRENT_SCHEMA_VERSION, Issue, IssueType, Result, Severity};
use phasegraph_storage::FileStore;

use crate::graph::Graph;
use crate::queue::{IssueQueue, IssueSummary};
use crate::router::Router;

/// Short deterministic digest of the open issues in `issues`.
///
/// ```text
/// 3 open issues: 2 high, 1 medium, 0 low
/// ```
pub fn format_notification(issues: &[Issue]) -> String {
    let mut counts = [0usize; 3];
    for issue in issues.iter().filter(|i| i.is_open()) {
        counts[issue.severity as usize] += 1;
    }
    let total: usize = counts.iter().sum();
    if total == 0 {
        return "no open issues".to_string();
    }
    let noun = if total == 1 { "issue" } else { "issues" };
    format!(
        "{total} open {noun}: {} high, {} medium, {} low",
        counts[Severity::High as usize],
        counts[Severity::Medium as usize],
        counts[Severity::Low as usize]
    )
}

// ---------------------------------------------------------------------------
// Status document
// ---------------------------------------------------------------------------

/// One open issue with enough context to act on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_label: Option<String>,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub rationale: String,
    pub detected_at: DateTime<Utc>,
    /// Routed resolver; absent when the type has no route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

/// Open issues of one phase, grouped by severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub phase: String,
    #[serde(default)]
    pub archived: bool,
    pub summary: IssueSummary,
    pub high: Vec<StatusEntry>,
    pub medium: Vec<StatusEntry>,
    pub low: Vec<StatusEntry>,
}

/// The `status.json` document polled by downstream collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub schema_version: u32,
    /// Increases by one on every regeneration.
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    /// [`format_notification`] over all open issues.
    pub digest: String,
    pub totals: IssueSummary,
    /// Ordered by phase name.
    pub phases: Vec<PhaseStatus>,
}

/// A phase's queue together with its graph (for labels), if loaded.
#[derive(Debug, Clone, Copy)]
pub struct PhaseView<'a> {
    pub queue: &'a IssueQueue,
    pub graph: Option<&'a Graph>,
}

/// Assemble the status document. Phases are emitted in the order given.
pub fn build_status_document(
    version: u64,
    generated_at: DateTime<Utc>,
    phases: &[PhaseView<'_>],
    router: &Router,
) -> StatusDocument {
    let mut totals = IssueSummary::default();
    let mut all_open = Vec::new();
    let mut sections = Vec::with_capacity(phases.len());

    for view in phases {
        let summary = view.queue.summarize();
        totals.merge(&summary);

        let mut section = PhaseStatus {
            phase: view.queue.phase().to_string(),
            archived: view.graph.is_some_and(Graph::is_archived),
            summary,
            high: Vec::new(),
            medium: Vec::new(),
            low: Vec::new(),
        };

        for issue in view.queue.open_issues() {
            all_open.push(issue.clone());
            let entry = StatusEntry {
                node_id: issue.node_id.clone(),
                node_label: view
                    .graph
                    .and_then(|g| g.node(&issue.node_id))
                    .map(|n| n.label.clone()),
                issue_type: issue.issue_type.clone(),
                severity: issue.severity,
                rationale: issue.rationale.clone(),
                detected_at: issue.detected_at,
                resolver: router.for_issue(&issue.issue_type).ok().map(str::to_string),
                assigned_to: router.assignment_for(issue).map(|a| a.resolver),
            };
            match issue.severity {
                Severity::High => section.high.push(entry),
                Severity::Medium => section.medium.push(entry),
                Severity::Low => section.low.push(entry),
            }
        }
        sections.push(section);
    }

    StatusDocument {
        schema_version: CURRENT_SCHEMA_VERSION,
        version,
        generated_at,
        digest: format_notification(&all_open),
        totals,
        phases: sections,
    }
}

/// Atomically replace `status.json` with `doc`.
#[instrument(skip_all, fields(version = doc.version))]
pub fn write_status_document(store: &FileStore, doc: &StatusDocument) -> Result<PathBuf> {
    let path = store.status_path();
    store.write_json(&path, doc)?;
    info!(path = %path.display(), digest = %doc.digest, "status document written");
    Ok(path)
}

/// Version of the status document currently on disk (0 when absent).
pub fn current_status_version(store: &FileStore) -> Result<u64> {
    Ok(store
        .read_json::<StatusDocument>(&store.status_path())?
        .map_or(0, |doc| doc.version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegraph_shared::{AppConfig, Node, NodeType};

    fn issue(node: &str, t: IssueType, severity: Severity) -> Issue {
        Issue {
            issue_type: t,
            node_id: node.into(),
            phase: "research".into(),
            severity,
            rationale: format!("{node} needs work"),
            detected_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn notification_counts_open_issues_only() {
        assert_eq!(format_notification(&[]), "no open issues");

        let mut resolved = issue("z", IssueType::LowConfidence, Severity::High);
        resolved.resolved_at = Some(Utc::now());
        let issues = vec![
            issue("a", IssueType::LowConfidence, Severity::High),
            issue("b", IssueType::MissingEvidence, Severity::High),
            issue("a", IssueType::SparseEntity, Severity::Medium),
            resolved,
        ];
        assert_eq!(
            format_notification(&issues),
            "3 open issues: 2 high, 1 medium, 0 low"
        );
        assert_eq!(
            format_notification(&issues[2..3]),
            "1 open issue: 0 high, 1 medium, 0 low"
        );
    }

    #[test]
    fn notification_is_order_independent() {
        let mut issues = vec![
            issue("a", IssueType::LowConfidence, Severity::High),
            issue("b", IssueType::Custom("X".into()), Severity::Low),
        ];
        let first = format_notification(&issues);
        issues.reverse();
        assert_eq!(format_notification(&issues), first);
    }

    #[test]
    fn status_document_groups_by_phase_and_severity() {
        let router = Router::new(&AppConfig::default().routing);

        let mut graph = Graph::new("research");
        graph
            .add_node(Node::new("a", NodeType::Entity, "Alpha", 0.6, "t"))
            .unwrap();

        let mut research = IssueQueue::new("research");
        research.add(issue("a", IssueType::LowConfidence, Severity::High));
        research.add(issue("a", IssueType::SparseEntity, Severity::Medium));
        research.add(issue("a", IssueType::Custom("Odd".into()), Severity::Low));
        router
            .assign(research.get("a", &IssueType::LowConfidence).unwrap(), "carol")
            .unwrap();

        let design = IssueQueue::new("design");

        let doc = build_status_document(
            7,
            Utc::now(),
            &[
                PhaseView {
                    queue: &design,
                    graph: None,
                },
                PhaseView {
                    queue: &research,
                    graph: Some(&graph),
                },
            ],
            &router,
        );

        assert_eq!(doc.version, 7);
        assert_eq!(doc.digest, "3 open issues: 1 high, 1 medium, 1 low");
        assert_eq!(doc.totals.open, 3);
        assert_eq!(doc.phases.len(), 2);
        assert!(doc.phases[0].high.is_empty());

        let research = &doc.phases[1];
        assert_eq!(research.high[0].node_label.as_deref(), Some("Alpha"));
        assert_eq!(research.high[0].resolver.as_deref(), Some("evidence-reviewer"));
        assert_eq!(research.high[0].assigned_to.as_deref(), Some("carol"));
        assert_eq!(research.medium[0].issue_type, IssueType::SparseEntity);
        // Unrouted custom types still appear, without a resolver.
        assert!(research.low[0].resolver.is_none());
    }

    #[test]
    fn write_and_read_back_version() {
        let root = std::env::temp_dir().join(format!("pg-notify-test-{}", uuid::Uuid::now_v7()));
        let store = FileStore::open(&root, std::time::Duration::from_millis(1)).unwrap();
        assert_eq!(current_status_version(&store).unwrap(), 0);

        let router = Router::default();
        let doc = build_status_document(3, Utc::now(), &[], &router);
        let path = write_status_document(&store, &doc).unwrap();
        assert!(path.ends_with("status.json"));
        assert_eq!(current_status_version(&store).unwrap(), 3);

        let _ = std::fs::remove_dir_all(&root);
    }
}
