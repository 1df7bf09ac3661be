//! The engine facade: one handle over a data directory that owns every phase
//! graph, its issue queue, the router and the status document.
//!
//! Every mutation runs detection for the touched node before it returns, so
//! callers never see a graph whose issues lag behind its content. Each phase
//! sits behind its own mutex; different phases never contend.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use phasegraph_shared::{
    AppConfig, BridgeArtifact, Edge, Issue, IssueType, MutationRecord, Node, NodePatch,
    PhaseGraphError, Result, Severity, WeightProfile,
};
use phasegraph_storage::FileStore;

use crate::bridge;
use crate::detector::Detector;
use crate::graph::Graph;
use crate::notify::{self, PhaseView, StatusDocument};
use crate::queue::{IssueQueue, IssueSummary};
use crate::router::{Assignment, Router};

// ---------------------------------------------------------------------------
// Public request / result types
// ---------------------------------------------------------------------------

/// What a successful mutation changed.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    pub record: MutationRecord,
    /// Issues opened by the detection pass that followed the mutation.
    pub opened: Vec<Issue>,
    /// Issues the detection pass closed.
    pub closed: Vec<Issue>,
}

/// Selects issues for [`Engine::query_issues`]. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueFilter {
    pub phase: Option<String>,
    pub severity: Option<Severity>,
    pub issue_type: Option<IssueType>,
    pub node_id: Option<String>,
    /// Also return resolved history.
    pub include_resolved: bool,
}

impl IssueFilter {
    /// Open issues of one phase.
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: Some(phase.into()),
            ..Self::default()
        }
    }

    fn matches(&self, issue: &Issue) -> bool {
        self.severity.is_none_or(|s| issue.severity == s)
            && self.issue_type.as_ref().is_none_or(|t| &issue.issue_type == t)
            && self.node_id.as_deref().is_none_or(|id| issue.node_id == id)
    }
}

/// A downstream phase and the profile its bridge is scored with.
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffTarget {
    pub phase: String,
    pub profile: WeightProfile,
}

impl HandoffTarget {
    pub fn new(phase: impl Into<String>, profile: WeightProfile) -> Self {
        Self {
            phase: phase.into(),
            profile,
        }
    }
}

/// Input to [`Engine::compress_for_handoff`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandoffRequest {
    pub source_phase: String,
    pub targets: Vec<HandoffTarget>,
    pub budget: usize,
    pub pins: Vec<String>,
}

/// A phase that failed to load and is held out of service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quarantine {
    pub path: PathBuf,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct PhaseState {
    graph: Graph,
    queue: IssueQueue,
}

type PhaseSlot = Arc<Mutex<PhaseState>>;

pub struct Engine {
    store: FileStore,
    config: AppConfig,
    detector: Detector,
    router: Router,
    phases: RwLock<BTreeMap<String, PhaseSlot>>,
    quarantined: RwLock<BTreeMap<String, Quarantine>>,
    /// Last written status version; the lock also serializes status writes.
    status_version: Mutex<u64>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("root", &self.store.root())
            .field("phases", &self.phase_names())
            .field("quarantined", &self.quarantined.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the data directory at `root`, loading every phase found there.
    ///
    /// Phases whose documents cannot be read or parsed are quarantined rather
    /// than failing the whole open.
    #[instrument(skip_all, fields(root = tracing::field::Empty))]
    pub fn open(root: impl Into<PathBuf>, config: AppConfig) -> Result<Self> {
        let root = root.into();
        tracing::Span::current().record("root", tracing::field::display(root.display()));

        let store = FileStore::open(
            root,
            Duration::from_millis(config.persistence.retry_backoff_ms),
        )?;

        let mut phases = BTreeMap::new();
        let mut quarantined = BTreeMap::new();
        for phase in store.list_phases()? {
            match load_phase(&store, &phase) {
                Ok(state) => {
                    debug!(
                        %phase,
                        nodes = state.graph.node_count(),
                        open_issues = state.queue.open_count(),
                        "phase loaded"
                    );
                    phases.insert(phase, Arc::new(Mutex::new(state)));
                }
                Err(PhaseGraphError::CorruptPersistedFile { path, reason }) => {
                    warn!(%phase, path = %path.display(), %reason, "phase quarantined");
                    quarantined.insert(phase, Quarantine { path, reason });
                }
                Err(PhaseGraphError::Io { path, source }) => {
                    let reason = source.to_string();
                    warn!(%phase, path = %path.display(), %reason, "phase unreadable, quarantined");
                    quarantined.insert(phase, Quarantine { path, reason });
                }
                Err(err @ PhaseGraphError::Validation { .. }) => {
                    warn!(%phase, error = %err, "skipping unrecognized phase directory");
                }
                Err(err) => return Err(err),
            }
        }

        let status_version = match notify::current_status_version(&store) {
            Ok(version) => version,
            Err(err) => {
                warn!(error = %err, "status document unreadable, restarting version count");
                0
            }
        };

        info!(
            phases = phases.len(),
            quarantined = quarantined.len(),
            status_version,
            "engine opened"
        );

        Ok(Self {
            store,
            detector: Detector::new(config.detector.clone()),
            router: Router::new(&config.routing),
            config,
            phases: RwLock::new(phases),
            quarantined: RwLock::new(quarantined),
            status_version: Mutex::new(status_version),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Loaded phase names, sorted.
    pub fn phase_names(&self) -> Vec<String> {
        self.phases.read().keys().cloned().collect()
    }

    /// Phases held out of service because a document failed to load.
    pub fn quarantined(&self) -> BTreeMap<String, Quarantine> {
        self.quarantined.read().clone()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add a node to `phase`, creating the phase on first use.
    ///
    /// With autosave on, a failed write returns the persistence error but the
    /// node stays in memory: repeating the call yields `DuplicateId`, and the
    /// next successful save or [`Engine::flush`] writes it out.
    #[instrument(skip_all, fields(phase = %phase, node_id = %node.id))]
    pub fn add_node(&self, phase: &str, node: Node) -> Result<MutationOutcome> {
        let (slot, created) = self.writable_slot(phase, true)?;
        let node_id = node.id.clone();
        let outcome = {
            let mut state = slot.lock();
            let record = match state.graph.add_node(node) {
                Ok(record) => record,
                Err(err) => {
                    drop(state);
                    if created {
                        self.discard_if_empty(phase);
                    }
                    return Err(err);
                }
            };
            let (opened, closed) = self.detect(&mut state, &node_id);
            self.autosave(&state)?;
            MutationOutcome {
                record,
                opened,
                closed,
            }
        };
        self.refresh_status()?;
        Ok(outcome)
    }

    /// Patch a node and re-run detection for it.
    ///
    /// Like [`Engine::add_node`], the patch stays applied in memory when the
    /// autosave fails.
    #[instrument(skip_all, fields(phase = %phase, node_id = %node_id))]
    pub fn update_node(&self, phase: &str, node_id: &str, patch: NodePatch) -> Result<MutationOutcome> {
        let (slot, _) = self.writable_slot(phase, false)?;
        let outcome = {
            let mut state = slot.lock();
            let record = state.graph.update_node(node_id, patch)?;
            let (opened, closed) = self.detect(&mut state, node_id);
            self.autosave(&state)?;
            MutationOutcome {
                record,
                opened,
                closed,
            }
        };
        self.refresh_status()?;
        Ok(outcome)
    }

    /// Add an edge and re-run detection for both endpoints. The edge stays in
    /// memory when the autosave fails.
    #[instrument(skip_all, fields(phase = %phase, source = %edge.source, target = %edge.target))]
    pub fn add_edge(&self, phase: &str, edge: Edge) -> Result<MutationOutcome> {
        let (slot, _) = self.writable_slot(phase, false)?;
        let endpoints = [edge.source.clone(), edge.target.clone()];
        let outcome = {
            let mut state = slot.lock();
            let record = state.graph.add_edge(edge)?;
            let mut opened = Vec::new();
            let mut closed = Vec::new();
            for id in &endpoints {
                let (o, c) = self.detect(&mut state, id);
                opened.extend(o);
                closed.extend(c);
            }
            self.autosave(&state)?;
            MutationOutcome {
                record,
                opened,
                closed,
            }
        };
        self.refresh_status()?;
        Ok(outcome)
    }

    /// Mark `phase` as completed. Its graph stays readable.
    #[instrument(skip_all, fields(phase = %phase))]
    pub fn archive_phase(&self, phase: &str) -> Result<MutationRecord> {
        let (slot, _) = self.writable_slot(phase, false)?;
        let record = {
            let mut state = slot.lock();
            let record = state.graph.archive()?;
            self.autosave(&state)?;
            record
        };
        info!(phase, "phase archived");
        self.refresh_status()?;
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    /// Issues matching `filter`, ordered by phase, severity (high first),
    /// node id and type.
    pub fn query_issues(&self, filter: &IssueFilter) -> Vec<Issue> {
        let slots: Vec<PhaseSlot> = {
            let phases = self.phases.read();
            phases
                .iter()
                .filter(|(name, _)| filter.phase.as_deref().is_none_or(|p| p == name.as_str()))
                .map(|(_, slot)| Arc::clone(slot))
                .collect()
        };

        let mut issues = Vec::new();
        for slot in slots {
            let state = slot.lock();
            issues.extend(state.queue.open_issues().filter(|i| filter.matches(i)).cloned());
            if filter.include_resolved {
                issues.extend(state.queue.resolved().iter().filter(|i| filter.matches(i)).cloned());
            }
        }

        issues.sort_by(|a, b| {
            a.phase
                .cmp(&b.phase)
                .then(a.severity.cmp(&b.severity))
                .then_with(|| a.node_id.cmp(&b.node_id))
                .then_with(|| a.issue_type.cmp(&b.issue_type))
                .then(a.detected_at.cmp(&b.detected_at))
        });
        issues
    }

    /// Resolve an open issue. Resolving an issue that is not open returns
    /// `Ok(None)` and changes nothing.
    #[instrument(skip_all, fields(phase = %phase, node_id = %node_id, issue_type = %issue_type))]
    pub fn resolve_issue(
        &self,
        phase: &str,
        node_id: &str,
        issue_type: &IssueType,
    ) -> Result<Option<Issue>> {
        let (slot, _) = self.writable_slot(phase, false)?;
        let resolved = {
            let mut state = slot.lock();
            let resolved = state.queue.resolve(node_id, issue_type, Utc::now());
            if let Some(issue) = &resolved {
                self.router.release(issue);
                self.autosave(&state)?;
            }
            resolved
        };
        if resolved.is_some() {
            self.refresh_status()?;
        }
        Ok(resolved)
    }

    /// Record who is working on an open issue. Without an explicit
    /// `resolver` the routed identity for the issue type is used.
    #[instrument(skip_all, fields(phase = %phase, node_id = %node_id, issue_type = %issue_type))]
    pub fn assign_issue(
        &self,
        phase: &str,
        node_id: &str,
        issue_type: &IssueType,
        resolver: Option<&str>,
    ) -> Result<Assignment> {
        let issue = {
            let slot = self.readable_slot(phase)?;
            let state = slot.lock();
            state.queue.get(node_id, issue_type).cloned().ok_or_else(|| {
                PhaseGraphError::validation(format!(
                    "no open {issue_type} issue for node '{node_id}' in phase '{phase}'"
                ))
            })?
        };
        let resolver = match resolver {
            Some(who) => who,
            None => self.router.for_issue(issue_type)?,
        };
        let assignment = self.router.assign(&issue, resolver)?;
        self.refresh_status()?;
        Ok(assignment)
    }

    /// Issue counts for one phase, or for all phases when `phase` is `None`.
    pub fn summarize(&self, phase: Option<&str>) -> Result<IssueSummary> {
        match phase {
            Some(phase) => Ok(self.readable_slot(phase)?.lock().queue.summarize()),
            None => {
                let slots: Vec<PhaseSlot> = self.phases.read().values().cloned().collect();
                let mut total = IssueSummary::default();
                for slot in slots {
                    total.merge(&slot.lock().queue.summarize());
                }
                Ok(total)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Compression
    // -----------------------------------------------------------------------

    /// A copy of `phase`'s graph as of now.
    pub fn graph_snapshot(&self, phase: &str) -> Result<Graph> {
        Ok(self.readable_slot(phase)?.lock().graph.clone())
    }

    /// Compress the source phase once per target and write each bridge
    /// artifact. Nothing is written unless every compression succeeds.
    #[instrument(skip_all, fields(source = %request.source_phase, targets = request.targets.len(), budget = request.budget))]
    pub fn compress_for_handoff(&self, request: &HandoffRequest) -> Result<Vec<BridgeArtifact>> {
        if request.targets.is_empty() {
            return Err(PhaseGraphError::validation(
                "handoff needs at least one target phase",
            ));
        }
        let snapshot = self.graph_snapshot(&request.source_phase)?;

        let artifacts = request
            .targets
            .iter()
            .map(|t| {
                bridge::compress(&snapshot, &t.phase, request.budget, &t.profile, &request.pins)
            })
            .collect::<Result<Vec<_>>>()?;

        for artifact in &artifacts {
            bridge::write_bridge(&self.store, artifact)?;
        }
        Ok(artifacts)
    }

    /// Feed two downstream phases from one snapshot of `source_phase`.
    pub fn compress_dual(
        &self,
        source_phase: &str,
        budget: usize,
        pins: &[String],
        first: &HandoffTarget,
        second: &HandoffTarget,
    ) -> Result<(BridgeArtifact, BridgeArtifact)> {
        let snapshot = self.graph_snapshot(source_phase)?;
        let (a, b) = bridge::compress_dual(
            &snapshot,
            budget,
            pins,
            (first.phase.as_str(), &first.profile),
            (second.phase.as_str(), &second.profile),
        )?;
        bridge::write_bridge(&self.store, &a)?;
        bridge::write_bridge(&self.store, &b)?;
        Ok((a, b))
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Regenerate `status.json` under the next version number.
    pub fn write_status_document(&self) -> Result<StatusDocument> {
        let mut version = self.status_version.lock();
        let slots: Vec<PhaseSlot> = self.phases.read().values().cloned().collect();

        let guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();
        let views: Vec<PhaseView<'_>> = guards
            .iter()
            .map(|state| PhaseView {
                queue: &state.queue,
                graph: Some(&state.graph),
            })
            .collect();
        let doc = notify::build_status_document(*version + 1, Utc::now(), &views, &self.router);
        drop(views);
        drop(guards);

        notify::write_status_document(&self.store, &doc)?;
        *version = doc.version;
        Ok(doc)
    }

    /// Persist every phase and the status document.
    #[instrument(skip_all)]
    pub fn flush(&self) -> Result<()> {
        let slots: Vec<PhaseSlot> = self.phases.read().values().cloned().collect();
        for slot in &slots {
            persist(&self.store, &slot.lock())?;
        }
        self.write_status_document()?;
        debug!(phases = slots.len(), "engine flushed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn readable_slot(&self, phase: &str) -> Result<PhaseSlot> {
        self.phases
            .read()
            .get(phase)
            .cloned()
            .ok_or_else(|| PhaseGraphError::PhaseNotFound {
                phase: phase.to_string(),
            })
    }

    /// The slot for a mutation against `phase`, and whether it was just created.
    fn writable_slot(&self, phase: &str, create: bool) -> Result<(PhaseSlot, bool)> {
        if let Some(q) = self.quarantined.read().get(phase) {
            return Err(PhaseGraphError::corrupt(&q.path, q.reason.clone()));
        }
        if let Some(slot) = self.phases.read().get(phase) {
            return Ok((Arc::clone(slot), false));
        }
        if !create {
            return Err(PhaseGraphError::PhaseNotFound {
                phase: phase.to_string(),
            });
        }

        self.store.phase_dir(phase)?;
        let mut phases = self.phases.write();
        if let Some(slot) = phases.get(phase) {
            return Ok((Arc::clone(slot), false));
        }
        let slot = Arc::new(Mutex::new(PhaseState {
            graph: Graph::new(phase),
            queue: IssueQueue::new(phase),
        }));
        phases.insert(phase.to_string(), Arc::clone(&slot));
        info!(phase, "phase created");
        Ok((slot, true))
    }

    /// Drop a phase created by a mutation that then failed.
    fn discard_if_empty(&self, phase: &str) {
        let mut phases = self.phases.write();
        let empty = phases
            .get(phase)
            .is_some_and(|slot| slot.lock().graph.mutation_log().is_empty());
        if empty {
            phases.remove(phase);
        }
    }

    fn detect(&self, state: &mut PhaseState, node_id: &str) -> (Vec<Issue>, Vec<Issue>) {
        let now = Utc::now();
        let Some(node) = state.graph.node(node_id) else {
            return (Vec::new(), Vec::new());
        };
        let delta = self.detector.diff(
            state.graph.phase(),
            node,
            state.queue.open_types_for(node_id),
            now,
        );
        if delta.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let (opened, closed) = state.queue.apply(delta, node_id, now);
        for issue in &closed {
            self.router.release(issue);
        }
        (opened, closed)
    }

    fn autosave(&self, state: &PhaseState) -> Result<()> {
        if self.config.persistence.autosave {
            persist(&self.store, state)?;
        }
        Ok(())
    }

    fn refresh_status(&self) -> Result<()> {
        if self.config.persistence.autosave {
            self.write_status_document()?;
        }
        Ok(())
    }
}

fn persist(store: &FileStore, state: &PhaseState) -> Result<()> {
    let phase = state.graph.phase();
    store.write_json(&store.graph_path(phase)?, &state.graph)?;
    store.write_json(&store.queue_path(phase)?, &state.queue)?;
    Ok(())
}

fn load_phase(store: &FileStore, phase: &str) -> Result<PhaseState> {
    let graph_path = store.graph_path(phase)?;
    let graph = store
        .read_json::<Graph>(&graph_path)?
        .unwrap_or_else(|| Graph::new(phase));
    if graph.phase() != phase {
        return Err(PhaseGraphError::corrupt(
            graph_path,
            format!("document belongs to phase '{}'", graph.phase()),
        ));
    }

    let queue_path = store.queue_path(phase)?;
    let queue = store
        .read_json::<IssueQueue>(&queue_path)?
        .unwrap_or_else(|| IssueQueue::new(phase));
    if queue.phase() != phase {
        return Err(PhaseGraphError::corrupt(
            queue_path,
            format!("document belongs to phase '{}'", queue.phase()),
        ));
    }
    if let Some(orphan) = queue.open_issues().find(|i| graph.node(&i.node_id).is_none()) {
        return Err(PhaseGraphError::corrupt(
            queue_path,
            format!("open issue references missing node '{}'", orphan.node_id),
        ));
    }

    Ok(PhaseState { graph, queue })
}

#[cfg(test)]
mod tests {
    use super::*;
    use phasegraph_shared::NodeType;

    fn temp_root(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pg-engine-{tag}-{}", uuid::Uuid::now_v7()))
    }

    fn solid(id: &str, node_type: NodeType) -> Node {
        Node::new(id, node_type, id.to_uppercase(), 0.95, "tester")
            .with_property("owner", "core")
            .with_property("tier", 1)
            .with_property("region", "eu")
            .with_evidence(format!("doc://{id}"))
    }

    /// Five nodes, only `weak` has defects.
    fn seed(engine: &Engine, phase: &str) {
        for (id, t) in [
            ("svc", NodeType::Entity),
            ("d1", NodeType::Decision),
            ("f1", NodeType::Finding),
        ] {
            engine.add_node(phase, solid(id, t)).unwrap();
        }
        engine
            .add_node(
                phase,
                Node::new("u1", NodeType::Uncertainty, "Peak load", 0.3, "tester"),
            )
            .unwrap();
        engine
            .add_node(
                phase,
                Node::new("weak", NodeType::Entity, "Cache", 0.6, "tester")
                    .with_property("owner", "core")
                    .with_property("created_by", "importer")
                    .with_evidence("doc://cache"),
            )
            .unwrap();
    }

    #[test]
    fn detects_sparse_and_low_confidence_on_mutation() {
        let root = temp_root("scenario-a");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");

        let issues = engine.query_issues(&IssueFilter::phase("research"));
        let found: Vec<(&str, IssueType, Severity)> = issues
            .iter()
            .map(|i| (i.node_id.as_str(), i.issue_type.clone(), i.severity))
            .collect();
        assert_eq!(
            found,
            vec![
                ("weak", IssueType::LowConfidence, Severity::High),
                ("weak", IssueType::SparseEntity, Severity::Medium),
            ]
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn uncertainty_raises_nothing() {
        let root = temp_root("scenario-c");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();

        let outcome = engine
            .add_node(
                "research",
                Node::new("u1", NodeType::Uncertainty, "Unknown", 0.3, "tester"),
            )
            .unwrap();
        assert!(outcome.opened.is_empty());
        assert_eq!(engine.summarize(Some("research")).unwrap().open, 0);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn resolving_unknown_issue_is_noop() {
        let root = temp_root("scenario-e");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");
        let before = engine.summarize(Some("research")).unwrap();

        let resolved = engine
            .resolve_issue("research", "svc", &IssueType::MissingEvidence)
            .unwrap();
        assert!(resolved.is_none());
        assert_eq!(engine.summarize(Some("research")).unwrap(), before);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn update_closes_issues_and_reruns_are_idempotent() {
        let root = temp_root("update");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");

        let mut patch = NodePatch {
            confidence: Some(0.9),
            ..NodePatch::default()
        };
        patch.properties.insert("tier".into(), 2.into());
        patch.properties.insert("region".into(), "us".into());

        let outcome = engine.update_node("research", "weak", patch).unwrap();
        assert!(outcome.opened.is_empty());
        assert_eq!(outcome.closed.len(), 2);
        assert!(outcome.closed.iter().all(|i| i.resolved_at.is_some()));

        let again = engine
            .update_node("research", "weak", NodePatch::default())
            .unwrap();
        assert!(again.opened.is_empty() && again.closed.is_empty());

        let history = engine.query_issues(&IssueFilter {
            include_resolved: true,
            ..IssueFilter::phase("research")
        });
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|i| !i.is_open()));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn failed_mutations_change_nothing() {
        let root = temp_root("failures");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");
        let before = engine.graph_snapshot("research").unwrap();

        let err = engine
            .add_edge("research", Edge::new("svc", "ghost", "depends_on"))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::DanglingReference { .. }));
        let err = engine
            .add_node("research", solid("svc", NodeType::Entity))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::DuplicateId { .. }));
        assert_eq!(engine.graph_snapshot("research").unwrap(), before);

        // A rejected first node does not leave an empty phase behind.
        let err = engine
            .add_node("design", Node::new("x", NodeType::Finding, "X", 2.0, "t"))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::InvalidConfidence { .. }));
        assert_eq!(engine.phase_names(), vec!["research"]);

        let err = engine
            .update_node("nowhere", "x", NodePatch::default())
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::PhaseNotFound { .. }));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn reopen_restores_graphs_queues_and_status_version() {
        let root = temp_root("reopen");
        let (graph, issues, version) = {
            let engine = Engine::open(&root, AppConfig::default()).unwrap();
            seed(&engine, "research");
            engine
                .add_edge("research", Edge::new("d1", "svc", "applies_to"))
                .unwrap();
            engine.flush().unwrap();
            let version = notify::current_status_version(engine.store()).unwrap();
            (
                engine.graph_snapshot("research").unwrap(),
                engine.query_issues(&IssueFilter::default()),
                version,
            )
        };
        assert!(version >= 7);

        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        assert_eq!(engine.graph_snapshot("research").unwrap(), graph);
        assert_eq!(engine.query_issues(&IssueFilter::default()), issues);

        let doc = engine.write_status_document().unwrap();
        assert_eq!(doc.version, version + 1);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_phase_is_quarantined_not_overwritten() {
        let root = temp_root("corrupt");
        {
            let engine = Engine::open(&root, AppConfig::default()).unwrap();
            seed(&engine, "research");
            engine
                .add_node("broken", solid("n1", NodeType::Finding))
                .unwrap();
        }
        let bad_path = root.join("phases").join("broken").join("graph.json");
        std::fs::write(&bad_path, "{ not json").unwrap();

        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        assert_eq!(engine.phase_names(), vec!["research"]);
        assert!(engine.quarantined().contains_key("broken"));

        let err = engine
            .add_node("broken", solid("n2", NodeType::Finding))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::CorruptPersistedFile { .. }));
        assert!(matches!(
            engine.graph_snapshot("broken"),
            Err(PhaseGraphError::PhaseNotFound { .. })
        ));
        engine.flush().unwrap();
        assert_eq!(std::fs::read_to_string(&bad_path).unwrap(), "{ not json");

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn unreadable_phase_is_quarantined_beside_healthy_one() {
        let root = temp_root("unreadable");
        {
            let engine = Engine::open(&root, AppConfig::default()).unwrap();
            seed(&engine, "good");
            engine
                .add_node("bad", solid("n1", NodeType::Finding))
                .unwrap();
        }
        // A directory where the graph document belongs cannot be read.
        let bad_path = root.join("phases").join("bad").join("graph.json");
        std::fs::remove_file(&bad_path).unwrap();
        std::fs::create_dir_all(bad_path.join("inner")).unwrap();

        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        assert_eq!(engine.phase_names(), vec!["good"]);
        let quarantine = engine.quarantined().remove("bad").unwrap();
        assert_eq!(quarantine.path, bad_path);
        assert!(!quarantine.reason.is_empty());

        assert_eq!(engine.graph_snapshot("good").unwrap().node_count(), 5);
        engine
            .add_node("good", solid("late", NodeType::Finding))
            .unwrap();
        assert!(matches!(
            engine.add_node("bad", solid("n2", NodeType::Finding)),
            Err(PhaseGraphError::CorruptPersistedFile { .. })
        ));
        assert!(bad_path.is_dir());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn failed_autosave_keeps_mutation_for_next_flush() {
        let root = temp_root("autosave-fail");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");

        let graph_path = root.join("phases").join("research").join("graph.json");
        std::fs::remove_file(&graph_path).unwrap();
        std::fs::create_dir_all(graph_path.join("inner")).unwrap();

        let err = engine
            .add_node("research", solid("late", NodeType::Finding))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::Io { .. }));
        assert!(engine.graph_snapshot("research").unwrap().node("late").is_some());

        let retry = engine
            .add_node("research", solid("late", NodeType::Finding))
            .unwrap_err();
        assert!(matches!(retry, PhaseGraphError::DuplicateId { .. }));

        std::fs::remove_dir_all(&graph_path).unwrap();
        engine.flush().unwrap();
        drop(engine);

        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        assert!(engine.graph_snapshot("research").unwrap().node("late").is_some());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn archived_phase_is_read_only_but_compressible() {
        let root = temp_root("archive");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");
        engine.archive_phase("research").unwrap();

        let err = engine
            .add_node("research", solid("late", NodeType::Finding))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::Archived { .. }));

        let artifacts = engine
            .compress_for_handoff(&HandoffRequest {
                source_phase: "research".into(),
                targets: vec![HandoffTarget::new("design", WeightProfile::default())],
                budget: 3,
                pins: vec!["u1".into()],
            })
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].nodes.len(), 3);
        assert!(artifacts[0].node_ids().contains(&"u1"));
        assert!(root.join("bridges").join("research--design.json").exists());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn dual_handoff_writes_two_artifacts() {
        let root = temp_root("dual");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "delivery");
        let before = engine.graph_snapshot("delivery").unwrap();

        let (ops, retro) = engine
            .compress_dual(
                "delivery",
                2,
                &[],
                &HandoffTarget::new("operations", WeightProfile::operational_readiness()),
                &HandoffTarget::new("retrospective", WeightProfile::lessons_learned()),
            )
            .unwrap();
        assert_eq!(ops.profile, "operational-readiness");
        assert_eq!(retro.profile, "lessons-learned");
        assert_eq!(engine.graph_snapshot("delivery").unwrap(), before);
        assert!(root.join("bridges").join("delivery--operations.json").exists());
        assert!(root.join("bridges").join("delivery--retrospective.json").exists());

        let err = engine
            .compress_for_handoff(&HandoffRequest {
                source_phase: "delivery".into(),
                targets: Vec::new(),
                budget: 2,
                pins: Vec::new(),
            })
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::Validation { .. }));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn assignment_appears_in_status_and_clears_on_resolve() {
        let root = temp_root("assign");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();
        seed(&engine, "research");

        let assignment = engine
            .assign_issue("research", "weak", &IssueType::LowConfidence, None)
            .unwrap();
        assert_eq!(assignment.resolver, "evidence-reviewer");

        let status: StatusDocument = engine
            .store()
            .read_json(&engine.store().status_path())
            .unwrap()
            .unwrap();
        let research = &status.phases[0];
        assert_eq!(
            research.high[0].assigned_to.as_deref(),
            Some("evidence-reviewer")
        );
        assert_eq!(status.digest, "2 open issues: 1 high, 1 medium, 0 low");

        // Assignment leaves the queue untouched.
        assert_eq!(engine.summarize(None).unwrap().open, 2);

        let resolved = engine
            .resolve_issue("research", "weak", &IssueType::LowConfidence)
            .unwrap()
            .unwrap();
        assert!(engine.router().assignment_for(&resolved).is_none());

        let err = engine
            .assign_issue("research", "svc", &IssueType::LowConfidence, Some("bob"))
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::Validation { .. }));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn unrouted_custom_issue_fails_loudly() {
        let root = temp_root("unrouted");
        let mut config = AppConfig::default();
        config.detector.extra_rules.push(phasegraph_shared::RuleSpec {
            issue_type: IssueType::Custom("UnbackedDecision".into()),
            severity: Severity::Low,
            condition: phasegraph_shared::RuleCondition::EvidenceEmpty,
            only_types: vec![NodeType::Decision],
            exempt_types: Vec::new(),
        });
        let engine = Engine::open(&root, config).unwrap();
        engine
            .add_node("design", Node::new("d", NodeType::Decision, "Go", 0.9, "t"))
            .unwrap();

        let custom = IssueType::Custom("UnbackedDecision".into());
        let err = engine
            .assign_issue("design", "d", &custom, None)
            .unwrap_err();
        assert!(matches!(err, PhaseGraphError::UnknownIssueType { .. }));
        let low = engine.query_issues(&IssueFilter {
            severity: Some(Severity::Low),
            ..IssueFilter::default()
        });
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].issue_type, custom);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn phases_mutate_concurrently() {
        let root = temp_root("concurrent");
        let engine = Engine::open(&root, AppConfig::default()).unwrap();

        std::thread::scope(|scope| {
            for phase in ["alpha", "beta", "gamma"] {
                let engine = &engine;
                scope.spawn(move || {
                    for i in 0..10 {
                        engine
                            .add_node(
                                phase,
                                Node::new(format!("n{i}"), NodeType::Finding, "F", 0.5, "t"),
                            )
                            .unwrap();
                    }
                });
            }
        });

        let summary = engine.summarize(None).unwrap();
        // Each Finding is low-confidence and has no evidence.
        assert_eq!(summary.open, 60);
        assert_eq!(engine.phase_names(), vec!["alpha", "beta", "gamma"]);

        let grouped = crate::queue::group_by_phase(
            engine
                .phase_names()
                .iter()
                .map(|p| engine.readable_slot(p).unwrap().lock().queue.clone())
                .collect::<Vec<_>>()
                .iter(),
        );
        assert!(grouped.values().all(|issues| issues.len() == 20));

        let _ = std::fs::remove_dir_all(&root);
    }
}
