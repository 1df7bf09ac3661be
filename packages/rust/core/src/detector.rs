//! Incremental issue detection.
//!
//! Rules are data ([`RuleSpec`]): an ordered list of `(condition, issue_type,
//! severity)` entries evaluated against a single node. Detection is
//! differential: the rule outcomes for one node are compared with that
//! node's currently open issues and only the difference is returned.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use phasegraph_shared::{DetectorConfig, Issue, IssueType, Node, RuleCondition, RuleSpec, Severity};

/// A rule that currently holds for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub rationale: String,
}

/// Result of evaluating every rule against one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    /// Rules that hold, in rule order, one per issue type.
    pub detections: Vec<Detection>,
    /// Issue types whose rule was malformed and skipped this pass.
    pub skipped: Vec<IssueType>,
}

/// Queue changes implied by re-evaluating one node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionDelta {
    pub opened: Vec<Issue>,
    pub closed: Vec<IssueType>,
}

impl DetectionDelta {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// Evaluates the configured rule list against individual nodes.
#[derive(Debug, Clone)]
pub struct Detector {
    config: DetectorConfig,
    rules: Vec<RuleSpec>,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl Detector {
    pub fn new(config: DetectorConfig) -> Self {
        let rules = config.rules();
        Self { config, rules }
    }

    pub fn rules(&self) -> &[RuleSpec] {
        &self.rules
    }

    /// Run every rule against `node`. Malformed rules are logged and skipped
    /// without affecting the others.
    pub fn evaluate(&self, node: &Node) -> Evaluation {
        let mut eval = Evaluation::default();
        let mut seen = BTreeSet::new();

        for (index, rule) in self.rules.iter().enumerate() {
            if let Err(reason) = rule.validate() {
                warn!(
                    rule = index,
                    issue_type = %rule.issue_type,
                    %reason,
                    "skipping malformed detection rule"
                );
                eval.skipped.push(rule.issue_type.clone());
                continue;
            }
            if !rule.applies_to(&node.node_type) || seen.contains(&rule.issue_type) {
                continue;
            }
            if let Some(rationale) = self.check(&rule.condition, node) {
                seen.insert(rule.issue_type.clone());
                eval.detections.push(Detection {
                    issue_type: rule.issue_type.clone(),
                    severity: rule.severity,
                    rationale,
                });
            }
        }
        eval
    }

    /// Diff the rule outcomes for `node` against the issue types currently
    /// open for it. Re-running on an unchanged node yields an empty delta.
    pub fn diff<'a>(
        &self,
        phase: &str,
        node: &Node,
        open: impl IntoIterator<Item = &'a IssueType>,
        now: DateTime<Utc>,
    ) -> DetectionDelta {
        let eval = self.evaluate(node);
        let open: BTreeSet<&IssueType> = open.into_iter().collect();
        let holding: BTreeSet<&IssueType> =
            eval.detections.iter().map(|d| &d.issue_type).collect();

        let opened = eval
            .detections
            .iter()
            .filter(|d| !open.contains(&d.issue_type))
            .map(|d| Issue {
                issue_type: d.issue_type.clone(),
                node_id: node.id.clone(),
                phase: phase.to_string(),
                severity: d.severity,
                rationale: d.rationale.clone(),
                detected_at: now,
                resolved_at: None,
            })
            .collect();

        // A skipped rule says nothing about its issue type this pass.
        let closed = open
            .iter()
            .filter(|t| !holding.contains(*t) && !eval.skipped.contains(**t))
            .map(|t| (*t).clone())
            .collect();

        let delta = DetectionDelta { opened, closed };
        if !delta.is_empty() {
            debug!(
                phase,
                node_id = %node.id,
                opened = delta.opened.len(),
                closed = delta.closed.len(),
                "detection delta"
            );
        }
        delta
    }

    /// Returns the rationale when `condition` holds for `node`.
    fn check(&self, condition: &RuleCondition, node: &Node) -> Option<String> {
        match condition {
            RuleCondition::SparseProperties { min } => {
                let count = self.descriptive_property_count(node);
                (count < *min).then(|| {
                    format!("{count} descriptive properties (minimum {min})")
                })
            }
            RuleCondition::ConfidenceBelow { threshold } => (node.confidence < *threshold)
                .then(|| format!("confidence {:.2} below {threshold:.2}", node.confidence)),
            RuleCondition::EvidenceEmpty => node
                .evidence
                .is_empty()
                .then(|| "no evidence citations".to_string()),
        }
    }

    fn descriptive_property_count(&self, node: &Node) -> usize {
        node.properties
            .keys()
            .filter(|k| !self.config.is_bookkeeping(k))
            .count()
    }
}
