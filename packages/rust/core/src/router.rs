//! Routes issue types to the collaborator responsible for resolving them.
//!
//! Routing is a static table lookup. Assignments are advisory bookkeeping:
//! they never change queue state, and an issue only leaves the queue through
//! an observed graph update or an explicit resolve.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use phasegraph_shared::{Issue, IssueType, PhaseGraphError, Result};

/// An advisory record that `resolver` is working on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub phase: String,
    pub node_id: String,
    pub issue_type: IssueType,
    pub resolver: String,
    pub assigned_at: DateTime<Utc>,
}

type AssignmentKey = (String, String, IssueType);

fn key_of(issue: &Issue) -> AssignmentKey {
    (
        issue.phase.clone(),
        issue.node_id.clone(),
        issue.issue_type.clone(),
    )
}

#[derive(Debug, Default)]
pub struct Router {
    table: BTreeMap<IssueType, String>,
    assignments: Mutex<BTreeMap<AssignmentKey, Assignment>>,
}

impl Router {
    /// Build a router from an `issue type → resolver` table.
    pub fn new(table: &BTreeMap<String, String>) -> Self {
        Self {
            table: table
                .iter()
                .map(|(t, who)| (IssueType::from(t.as_str()), who.clone()))
                .collect(),
            assignments: Mutex::new(BTreeMap::new()),
        }
    }

    /// The resolver responsible for `issue_type`. Unrouted types are an
    /// error so no issue is dropped through a missing entry.
    pub fn for_issue(&self, issue_type: &IssueType) -> Result<&str> {
        self.table
            .get(issue_type)
            .map(String::as_str)
            .ok_or_else(|| PhaseGraphError::UnknownIssueType {
                issue_type: issue_type.to_string(),
            })
    }

    /// Record that `resolver` picked up `issue`. Replaces any earlier assignment.
    pub fn assign(&self, issue: &Issue, resolver: &str) -> Result<Assignment> {
        if resolver.trim().is_empty() {
            return Err(PhaseGraphError::validation("resolver identity must not be empty"));
        }
        let assignment = Assignment {
            phase: issue.phase.clone(),
            node_id: issue.node_id.clone(),
            issue_type: issue.issue_type.clone(),
            resolver: resolver.to_string(),
            assigned_at: Utc::now(),
        };
        self.assignments
            .lock()
            .insert(key_of(issue), assignment.clone());
        debug!(
            phase = %issue.phase,
            node_id = %issue.node_id,
            issue_type = %issue.issue_type,
            resolver,
            "issue assigned"
        );
        Ok(assignment)
    }

    /// Current advisory assignee for `issue`, if any.
    pub fn assignment_for(&self, issue: &Issue) -> Option<Assignment> {
        self.assignments.lock().get(&key_of(issue)).cloned()
    }

    /// Forget the assignment of a resolved issue.
    pub fn release(&self, issue: &Issue) {
        self.assignments.lock().remove(&key_of(issue));
    }

    /// All assignments, ordered by phase, node and type.
    pub fn assignments(&self) -> Vec<Assignment> {
        self.assignments.lock().values().cloned().collect()
    }
}
