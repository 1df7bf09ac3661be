//! Deduplicated issue queue with append-only resolved history.
//!
//! One [`IssueQueue`] exists per phase. Open issues are keyed by
//! `(node_id, issue_type)`, so the queue can never hold two open issues for
//! the same defect on the same node.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use phasegraph_shared::{CURRENT_SCHEMA_VERSION, Issue, IssueType, Severity};

use crate::detector::DetectionDelta;

type IssueKey = (String, IssueType);

/// Open and resolved issues for one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QueueDocument", into = "QueueDocument")]
pub struct IssueQueue {
    phase: String,
    open: BTreeMap<IssueKey, Issue>,
    resolved: Vec<Issue>,
}

/// Counts of issues by severity and type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub open: usize,
    pub resolved: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_type: BTreeMap<String, usize>,
}

impl IssueSummary {
    /// Open issues of `severity` (zero when absent).
    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }

    /// Fold another summary into this one.
    pub fn merge(&mut self, other: &IssueSummary) {
        self.open += other.open;
        self.resolved += other.resolved;
        for (severity, n) in &other.by_severity {
            *self.by_severity.entry(*severity).or_insert(0) += n;
        }
        for (t, n) in &other.by_type {
            *self.by_type.entry(t.clone()).or_insert(0) += n;
        }
    }
}

impl IssueQueue {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            open: BTreeMap::new(),
            resolved: Vec::new(),
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    /// Open issues ordered by `(node_id, issue_type)`.
    pub fn open_issues(&self) -> impl Iterator<Item = &Issue> {
        self.open.values()
    }

    /// Resolved history in resolution order.
    pub fn resolved(&self) -> &[Issue] {
        &self.resolved
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn get(&self, node_id: &str, issue_type: &IssueType) -> Option<&Issue> {
        self.open.get(&(node_id.to_string(), issue_type.clone()))
    }

    /// Issue types currently open for `node_id`.
    pub fn open_types_for(&self, node_id: &str) -> Vec<&IssueType> {
        // SparseEntity is the smallest IssueType.
        self.open
            .range((node_id.to_string(), IssueType::SparseEntity)..)
            .take_while(|((id, _), _)| id == node_id)
            .map(|((_, t), _)| t)
            .collect()
    }

    /// Open `issue` unless an open issue with the same key exists.
    /// Returns whether the queue changed.
    pub fn add(&mut self, mut issue: Issue) -> bool {
        let key = (issue.node_id.clone(), issue.issue_type.clone());
        if self.open.contains_key(&key) {
            debug!(phase = %self.phase, node_id = %issue.node_id, issue_type = %issue.issue_type, "issue already open");
            return false;
        }
        issue.phase = self.phase.clone();
        issue.resolved_at = None;
        self.open.insert(key, issue);
        true
    }

    /// Move the matching open issue to history, stamped `at`.
    ///
    /// Resolving an issue that is not open is a logged no-op: detection may
    /// already have closed it.
    pub fn resolve(
        &mut self,
        node_id: &str,
        issue_type: &IssueType,
        at: DateTime<Utc>,
    ) -> Option<Issue> {
        let key = (node_id.to_string(), issue_type.clone());
        match self.open.remove(&key) {
            Some(mut issue) => {
                issue.resolved_at = Some(at);
                self.resolved.push(issue.clone());
                debug!(phase = %self.phase, node_id, %issue_type, "issue resolved");
                Some(issue)
            }
            None => {
                warn!(phase = %self.phase, node_id, %issue_type, "resolve ignored: no open issue");
                None
            }
        }
    }

    /// Apply a detection delta: close first, then open.
    /// Returns the issues opened and the issues closed.
    pub fn apply(
        &mut self,
        delta: DetectionDelta,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> (Vec<Issue>, Vec<Issue>) {
        let closed = delta
            .closed
            .iter()
            .filter_map(|t| self.resolve(node_id, t, at))
            .collect();
        let opened = delta
            .opened
            .into_iter()
            .filter(|issue| self.add(issue.clone()))
            .collect();
        (opened, closed)
    }

    pub fn summarize(&self) -> IssueSummary {
        let mut summary = IssueSummary {
            open: self.open.len(),
            resolved: self.resolved.len(),
            ..IssueSummary::default()
        };
        for issue in self.open.values() {
            *summary.by_severity.entry(issue.severity).or_insert(0) += 1;
            *summary
                .by_type
                .entry(issue.issue_type.to_string())
                .or_insert(0) += 1;
        }
        summary
    }
}

/// Partition open issues by owning phase.
pub fn group_by_phase<'a>(
    queues: impl IntoIterator<Item = &'a IssueQueue>,
) -> BTreeMap<String, Vec<Issue>> {
    let mut groups: BTreeMap<String, Vec<Issue>> = BTreeMap::new();
    for queue in queues {
        groups
            .entry(queue.phase.clone())
            .or_default()
            .extend(queue.open_issues().cloned());
    }
    groups
}

// ---------------------------------------------------------------------------
// Persisted form
// ---------------------------------------------------------------------------

/// On-disk layout of `issues.json`: one flat list of issue records.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueDocument {
    schema_version: u32,
    phase: String,
    issues: Vec<Issue>,
}

impl From<IssueQueue> for QueueDocument {
    fn from(queue: IssueQueue) -> Self {
        let mut issues: Vec<Issue> = queue.resolved;
        issues.extend(queue.open.into_values());
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            phase: queue.phase,
            issues,
        }
    }
}

impl TryFrom<QueueDocument> for IssueQueue {
    type Error = String;

    fn try_from(doc: QueueDocument) -> std::result::Result<Self, Self::Error> {
        if doc.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(format!(
                "unsupported schema_version: {} (expected {CURRENT_SCHEMA_VERSION})",
                doc.schema_version
            ));
        }

        let mut queue = IssueQueue::new(doc.phase);
        for issue in doc.issues {
            if issue.is_open() {
                let key = (issue.node_id.clone(), issue.issue_type.clone());
                if queue.open.insert(key, issue).is_some() {
                    return Err("duplicate open issue for the same node and type".into());
                }
            } else {
                queue.resolved.push(issue);
            }
        }
        Ok(queue)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
