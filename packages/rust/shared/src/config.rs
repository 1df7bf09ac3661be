//! Application configuration for PhaseGraph.
//!
//! User config lives at `~/.phasegraph/phasegraph.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PhaseGraphError, Result};
use crate::types::{IssueType, NodeType, Severity};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "phasegraph.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".phasegraph";

/// Name of the profile used when a caller does not pick one.
pub const DEFAULT_PROFILE: &str = "default";

// ---------------------------------------------------------------------------
// Config structs (matching phasegraph.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Issue detector thresholds and extra rules.
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Persistence behaviour.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Issue type → resolver identity.
    #[serde(default = "default_routing")]
    pub routing: BTreeMap<String, String>,

    /// Extra or overriding weight profiles, keyed by name.
    #[serde(default)]
    pub profiles: BTreeMap<String, WeightProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            detector: DetectorConfig::default(),
            persistence: PersistenceConfig::default(),
            routing: default_routing(),
            profiles: BTreeMap::new(),
        }
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory holding phase graphs, queues, status and bridges.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Default handoff budget (max nodes per bridge artifact).
    #[serde(default = "default_budget")]
    pub budget: usize,

    /// Default weight profile name.
    #[serde(default = "default_profile")]
    pub profile: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            budget: default_budget(),
            profile: default_profile(),
        }
    }
}

fn default_data_dir() -> String {
    "var/phasegraph".into()
}
fn default_budget() -> usize {
    20
}
fn default_profile() -> String {
    DEFAULT_PROFILE.into()
}

/// `[detector]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Claims below this confidence raise `LowConfidence`.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Entities/Concepts with fewer descriptive properties raise `SparseEntity`.
    #[serde(default = "default_min_properties")]
    pub min_properties: usize,

    /// Property keys that do not count as descriptive. Keys starting with
    /// `_` are always bookkeeping.
    #[serde(default = "default_bookkeeping_keys")]
    pub bookkeeping_keys: Vec<String>,

    /// Additional rules evaluated after the built-in ones.
    #[serde(default)]
    pub extra_rules: Vec<RuleSpec>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            min_properties: default_min_properties(),
            bookkeeping_keys: default_bookkeeping_keys(),
            extra_rules: Vec::new(),
        }
    }
}

fn default_confidence_threshold() -> f64 {
    0.85
}
fn default_min_properties() -> usize {
    3
}
fn default_bookkeeping_keys() -> Vec<String> {
    ["id", "type", "phase", "source", "created_by", "created_at", "updated_at"]
        .iter()
        .map(|k| (*k).to_string())
        .collect()
}

/// `[persistence]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Flush the touched phase after every successful mutation.
    #[serde(default = "default_true")]
    pub autosave: bool,

    /// Delay before the single retry of a failed write.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            autosave: true,
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_retry_backoff() -> u64 {
    50
}

fn default_routing() -> BTreeMap<String, String> {
    [
        (IssueType::SparseEntity, "entity-enricher"),
        (IssueType::LowConfidence, "evidence-reviewer"),
        (IssueType::MissingEvidence, "evidence-researcher"),
    ]
    .into_iter()
    .map(|(t, who)| (t.to_string(), who.to_string()))
    .collect()
}

// ---------------------------------------------------------------------------
// Detection rules
// ---------------------------------------------------------------------------

/// A declarative detection rule: when `condition` holds for a node whose type
/// passes the type filters, an issue of `issue_type` is opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub issue_type: IssueType,
    pub severity: Severity,
    pub condition: RuleCondition,
    /// If non-empty, the rule only applies to these node types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only_types: Vec<NodeType>,
    /// Node types the rule never applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exempt_types: Vec<NodeType>,
}

/// Predicate half of a [`RuleSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// Fewer than `min` non-bookkeeping properties.
    SparseProperties { min: usize },
    /// Confidence strictly below `threshold`.
    ConfidenceBelow { threshold: f64 },
    /// No evidence citations.
    EvidenceEmpty,
}

impl RuleSpec {
    /// Check the rule is well-formed. Returns the reason when it is not.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.condition {
            RuleCondition::SparseProperties { min: 0 } => {
                return Err("sparse_properties.min must be at least 1".into());
            }
            RuleCondition::ConfidenceBelow { threshold }
                if !crate::types::is_valid_confidence(*threshold) =>
            {
                return Err(format!(
                    "confidence_below.threshold {threshold} outside [0, 1]"
                ));
            }
            _ => {}
        }
        if let Some(t) = self.only_types.iter().find(|t| self.exempt_types.contains(t)) {
            return Err(format!("node type '{t}' is both required and exempted"));
        }
        Ok(())
    }

    /// Whether the rule's type filters admit `node_type`.
    pub fn applies_to(&self, node_type: &NodeType) -> bool {
        (self.only_types.is_empty() || self.only_types.contains(node_type))
            && !self.exempt_types.contains(node_type)
    }
}

impl DetectorConfig {
    /// The ordered rule list: built-in rules first, then `extra_rules`.
    pub fn rules(&self) -> Vec<RuleSpec> {
        let mut rules = vec![
            RuleSpec {
                issue_type: IssueType::SparseEntity,
                severity: Severity::Medium,
                condition: RuleCondition::SparseProperties {
                    min: self.min_properties,
                },
                only_types: vec![NodeType::Entity, NodeType::Concept],
                exempt_types: Vec::new(),
            },
            RuleSpec {
                issue_type: IssueType::LowConfidence,
                severity: Severity::High,
                condition: RuleCondition::ConfidenceBelow {
                    threshold: self.confidence_threshold,
                },
                only_types: Vec::new(),
                exempt_types: vec![NodeType::Uncertainty],
            },
            RuleSpec {
                issue_type: IssueType::MissingEvidence,
                severity: Severity::High,
                condition: RuleCondition::EvidenceEmpty,
                only_types: Vec::new(),
                exempt_types: vec![NodeType::Uncertainty],
            },
        ];
        rules.extend(self.extra_rules.iter().cloned());
        rules
    }

    /// Whether a property key is bookkeeping rather than descriptive.
    pub fn is_bookkeeping(&self, key: &str) -> bool {
        key.starts_with('_') || self.bookkeeping_keys.iter().any(|k| k == key)
    }
}

// ---------------------------------------------------------------------------
// Weight profiles
// ---------------------------------------------------------------------------

/// Scoring weights used by the bridge compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightProfile {
    /// Profile name, recorded on every artifact it produces.
    #[serde(default)]
    pub name: String,

    /// Per-type priority in `[0, 1]`, keyed by node type name.
    #[serde(default)]
    pub type_priority: BTreeMap<String, f64>,

    /// Priority for types missing from `type_priority`.
    #[serde(default = "default_type_priority")]
    pub default_type_priority: f64,

    #[serde(default = "default_type_weight")]
    pub type_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_connectivity_weight")]
    pub connectivity_weight: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,

    /// Age at which the recency factor halves.
    #[serde(default = "default_half_life")]
    pub recency_half_life_hours: f64,
}

fn default_type_priority() -> f64 {
    0.4
}
fn default_type_weight() -> f64 {
    0.4
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_connectivity_weight() -> f64 {
    0.2
}
fn default_confidence_weight() -> f64 {
    0.2
}
fn default_half_life() -> f64 {
    24.0
}

fn priorities(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

impl Default for WeightProfile {
    fn default() -> Self {
        Self {
            name: DEFAULT_PROFILE.into(),
            type_priority: priorities(&[
                ("Decision", 1.0),
                ("Entity", 0.9),
                ("Finding", 0.8),
                ("Concept", 0.6),
                ("Task", 0.5),
                ("Uncertainty", 0.3),
            ]),
            default_type_priority: default_type_priority(),
            type_weight: default_type_weight(),
            recency_weight: default_recency_weight(),
            connectivity_weight: default_connectivity_weight(),
            confidence_weight: default_confidence_weight(),
            recency_half_life_hours: default_half_life(),
        }
    }
}

impl WeightProfile {
    /// Favors committed decisions and high-confidence canon.
    pub fn operational_readiness() -> Self {
        Self {
            name: "operational-readiness".into(),
            type_priority: priorities(&[
                ("Decision", 1.0),
                ("Entity", 0.85),
                ("Task", 0.7),
                ("Finding", 0.6),
                ("Concept", 0.5),
                ("Uncertainty", 0.2),
            ]),
            type_weight: 0.45,
            recency_weight: 0.1,
            connectivity_weight: 0.15,
            confidence_weight: 0.3,
            ..Self::default()
        }
    }

    /// Favors findings, open questions and recent learning.
    pub fn lessons_learned() -> Self {
        Self {
            name: "lessons-learned".into(),
            type_priority: priorities(&[
                ("Finding", 1.0),
                ("Uncertainty", 0.8),
                ("Decision", 0.7),
                ("Concept", 0.6),
                ("Entity", 0.5),
                ("Task", 0.3),
            ]),
            type_weight: 0.4,
            recency_weight: 0.35,
            connectivity_weight: 0.15,
            confidence_weight: 0.1,
            recency_half_life_hours: 72.0,
            ..Self::default()
        }
    }

    /// Priority for a node type under this profile.
    pub fn priority_of(&self, node_type: &NodeType) -> f64 {
        self.type_priority
            .get(node_type.as_str())
            .copied()
            .unwrap_or(self.default_type_priority)
    }

    /// Reject negative or non-finite weights and a non-positive half-life.
    pub fn validate(&self) -> Result<()> {
        let weights = [
            ("type_weight", self.type_weight),
            ("recency_weight", self.recency_weight),
            ("connectivity_weight", self.connectivity_weight),
            ("confidence_weight", self.confidence_weight),
            ("default_type_priority", self.default_type_priority),
        ];
        for (field, value) in weights
            .into_iter()
            .chain(self.type_priority.iter().map(|(k, v)| (k.as_str(), *v)))
        {
            if !value.is_finite() || value < 0.0 {
                return Err(PhaseGraphError::config(format!(
                    "profile '{}': {field} must be a non-negative number (got {value})",
                    self.name
                )));
            }
        }
        if !(self.recency_half_life_hours.is_finite() && self.recency_half_life_hours > 0.0) {
            return Err(PhaseGraphError::config(format!(
                "profile '{}': recency_half_life_hours must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Look up a weight profile: configured profiles win over built-ins.
    pub fn profile(&self, name: &str) -> Result<WeightProfile> {
        if let Some(p) = self.profiles.get(name) {
            let mut p = p.clone();
            p.name = name.to_string();
            p.validate()?;
            return Ok(p);
        }
        match name {
            DEFAULT_PROFILE => Ok(WeightProfile::default()),
            "operational-readiness" => Ok(WeightProfile::operational_readiness()),
            "lessons-learned" => Ok(WeightProfile::lessons_learned()),
            other => Err(PhaseGraphError::config(format!(
                "unknown weight profile '{other}'"
            ))),
        }
    }

    /// The data directory as a path.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.defaults.data_dir)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.phasegraph/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| PhaseGraphError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.phasegraph/phasegraph.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| PhaseGraphError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        PhaseGraphError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| PhaseGraphError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| PhaseGraphError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| PhaseGraphError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("confidence_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.defaults.budget, 20);
        assert_eq!(parsed.detector.min_properties, 3);
        assert_eq!(parsed.routing, config.routing);
    }

    #[test]
    fn empty_file_gets_default_routing() {
        let parsed: AppConfig = toml::from_str("").expect("parse");
        assert_eq!(
            parsed.routing.get("LowConfidence").map(String::as_str),
            Some("evidence-reviewer")
        );
        assert!(parsed.persistence.autosave);
    }

    #[test]
    fn config_with_rules_and_profiles() {
        let toml_str = r#"
[defaults]
data_dir = "/tmp/pg"
budget = 12

[detector]
confidence_threshold = 0.9

[[detector.extra_rules]]
issue_type = "UnlabeledDecision"
severity = "low"
only_types = ["Decision"]
condition = { kind = "evidence_empty" }

[routing]
UnlabeledDecision = "decision-steward"

[profiles.audit]
type_priority = { Finding = 1.0 }
recency_weight = 0.0
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.budget, 12);
        assert_eq!(config.detector.extra_rules.len(), 1);
        assert_eq!(
            config.detector.extra_rules[0].issue_type,
            IssueType::Custom("UnlabeledDecision".into())
        );
        // Routing replaces the defaults wholesale when present.
        assert_eq!(config.routing.len(), 1);

        let audit = config.profile("audit").expect("audit profile");
        assert_eq!(audit.name, "audit");
        assert_eq!(audit.recency_weight, 0.0);
        assert_eq!(audit.priority_of(&NodeType::Finding), 1.0);
        assert_eq!(audit.priority_of(&NodeType::Decision), 0.4);
    }

    #[test]
    fn builtin_rules_in_order() {
        let rules = DetectorConfig::default().rules();
        let types: Vec<_> = rules.iter().map(|r| r.issue_type.clone()).collect();
        assert_eq!(
            types,
            vec![
                IssueType::SparseEntity,
                IssueType::LowConfidence,
                IssueType::MissingEvidence
            ]
        );
        assert!(rules.iter().all(|r| r.validate().is_ok()));
    }

    #[test]
    fn malformed_rules_fail_validation() {
        let mut rule = DetectorConfig::default().rules().remove(1);
        rule.condition = RuleCondition::ConfidenceBelow { threshold: 1.5 };
        assert!(rule.validate().is_err());

        let mut rule = DetectorConfig::default().rules().remove(0);
        rule.exempt_types.push(NodeType::Entity);
        assert!(rule.validate().unwrap_err().contains("Entity"));
    }

    #[test]
    fn bookkeeping_keys() {
        let detector = DetectorConfig::default();
        assert!(detector.is_bookkeeping("_internal"));
        assert!(detector.is_bookkeeping("created_by"));
        assert!(!detector.is_bookkeeping("owner"));
    }

    #[test]
    fn builtin_profiles_resolve() {
        let config = AppConfig::default();
        for name in ["default", "operational-readiness", "lessons-learned"] {
            let p = config.profile(name).expect("builtin profile");
            assert_eq!(p.name, name);
            assert!(p.validate().is_ok());
        }
        assert!(config.profile("nope").is_err());
    }

    #[test]
    fn negative_weights_rejected() {
        let p = WeightProfile {
            recency_weight: -1.0,
            ..WeightProfile::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn load_config_from_file() {
        let dir = std::env::temp_dir().join(format!("pg-config-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[defaults]\nbudget = 7\n").unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.defaults.budget, 7);

        std::fs::write(&path, "[defaults\n").unwrap();
        assert!(load_config_from(&path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
