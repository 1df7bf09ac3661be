//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use phasegraph_core::{
    Engine, HandoffRequest, HandoffTarget, IssueFilter, MutationOutcome, format_notification,
};
use phasegraph_shared::{
    AppConfig, Edge, Issue, IssueType, Node, NodePatch, Severity, init_config, load_config,
    load_config_from,
};
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PhaseGraph: keep phase knowledge honest and hand it forward.
#[derive(Parser)]
#[command(
    name = "phasegraph",
    version,
    about = "Track per-phase knowledge graphs, surface quality issues, and compress handoffs.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.phasegraph/phasegraph.toml).
    #[arg(long, env = "PHASEGRAPH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (overrides `defaults.data_dir`).
    #[arg(long, env = "PHASEGRAPH_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Add or patch nodes.
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Add edges.
    Edge {
        #[command(subcommand)]
        action: EdgeAction,
    },

    /// List issues.
    Issues {
        #[arg(long)]
        phase: Option<String>,

        /// Only issues of this severity (high, medium, low).
        #[arg(long, value_parser = parse_severity)]
        severity: Option<Severity>,

        /// Only issues of this type.
        #[arg(long = "type")]
        issue_type: Option<String>,

        /// Only issues on this node.
        #[arg(long)]
        node: Option<String>,

        /// Include resolved history.
        #[arg(long)]
        all: bool,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Resolve an open issue.
    Resolve(IssueRef),

    /// Record who is working on an open issue.
    Assign {
        #[command(flatten)]
        issue: IssueRef,

        /// Resolver identity (defaults to the routed resolver).
        #[arg(long)]
        to: Option<String>,
    },

    /// Compress a phase into bridge artifacts for downstream phases.
    Compress {
        /// Source phase.
        #[arg(long)]
        from: String,

        /// Target phase, optionally with a weight profile: `name[:profile]`.
        /// Repeat to feed several phases from one snapshot.
        #[arg(long = "target", required = true, value_parser = parse_target)]
        targets: Vec<(String, Option<String>)>,

        /// Maximum nodes per artifact (defaults to `defaults.budget`).
        #[arg(long)]
        budget: Option<usize>,

        /// Node ids that must be carried forward.
        #[arg(long = "pin")]
        pins: Vec<String>,
    },

    /// Mark a phase as completed; its graph becomes read-only.
    Archive {
        #[arg(long)]
        phase: String,
    },

    /// Regenerate and print the status document.
    Status {
        /// Print the full JSON document.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Node subcommands.
#[derive(Subcommand)]
pub(crate) enum NodeAction {
    /// Add a node (creates the phase on first use).
    Add {
        #[arg(long)]
        phase: String,

        #[arg(long)]
        id: String,

        /// Node type: Entity, Concept, Decision, Finding, Uncertainty, Task, or any other label.
        #[arg(long = "type")]
        node_type: String,

        #[arg(long)]
        label: String,

        #[arg(long)]
        description: Option<String>,

        #[arg(long, default_value_t = 1.0)]
        confidence: f64,

        /// Property as `key=value`; JSON values are parsed, anything else is a string.
        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, serde_json::Value)>,

        /// Evidence citation (repeatable).
        #[arg(long)]
        evidence: Vec<String>,

        #[arg(long, default_value = "cli")]
        created_by: String,
    },

    /// Patch an existing node.
    Update {
        #[arg(long)]
        phase: String,

        #[arg(long)]
        id: String,

        #[arg(long)]
        label: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        confidence: Option<f64>,

        #[arg(long = "prop", value_parser = parse_property)]
        props: Vec<(String, serde_json::Value)>,

        #[arg(long)]
        evidence: Vec<String>,
    },
}

/// Edge subcommands.
#[derive(Subcommand)]
pub(crate) enum EdgeAction {
    /// Add a directed edge between two existing nodes.
    Add {
        #[arg(long)]
        phase: String,

        #[arg(long)]
        source: String,

        #[arg(long)]
        target: String,

        #[arg(long)]
        relation: String,

        #[arg(long, default_value = "")]
        rationale: String,
    },
}

/// Identifies one issue.
#[derive(Args)]
pub(crate) struct IssueRef {
    #[arg(long)]
    pub phase: String,

    #[arg(long)]
    pub node: String,

    #[arg(long = "type")]
    pub issue_type: String,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "phasegraph=info,phasegraph_core=info,phasegraph_shared=info,phasegraph_storage=warn",
        1 => "phasegraph=debug,phasegraph_core=debug,phasegraph_shared=debug,phasegraph_storage=debug",
        _ => "phasegraph=trace,phasegraph_core=trace,phasegraph_shared=trace,phasegraph_storage=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) fn run(cli: Cli) -> Result<()> {
    if let Command::Config {
        action: ConfigAction::Init,
    } = cli.command
    {
        return cmd_config_init();
    }

    let config = resolve_config(cli.config.as_deref(), cli.data_dir.as_deref())?;

    match cli.command {
        Command::Node { action } => cmd_node(&config, action),
        Command::Edge {
            action:
                EdgeAction::Add {
                    phase,
                    source,
                    target,
                    relation,
                    rationale,
                },
        } => {
            let engine = open_engine(&config)?;
            let edge = Edge {
                rationale,
                ..Edge::new(source, target, relation)
            };
            let outcome = engine.add_edge(&phase, edge)?;
            print_outcome(&outcome);
            Ok(())
        }
        Command::Issues {
            phase,
            severity,
            issue_type,
            node,
            all,
            json,
        } => {
            let filter = IssueFilter {
                phase,
                severity,
                issue_type: issue_type.map(IssueType::from),
                node_id: node,
                include_resolved: all,
            };
            cmd_issues(&config, &filter, json)
        }
        Command::Resolve(issue) => cmd_resolve(&config, &issue),
        Command::Assign { issue, to } => cmd_assign(&config, &issue, to.as_deref()),
        Command::Compress {
            from,
            targets,
            budget,
            pins,
        } => cmd_compress(&config, from, &targets, budget, pins),
        Command::Archive { phase } => {
            let engine = open_engine(&config)?;
            let record = engine.archive_phase(&phase)?;
            println!("Archived phase '{phase}' (mutation #{})", record.seq);
            Ok(())
        }
        Command::Status { json } => cmd_status(&config, json),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(&config),
        },
    }
}

/// Load the config file, then apply CLI overrides.
fn resolve_config(path: Option<&Path>, data_dir: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(dir) = data_dir {
        config.defaults.data_dir = dir.to_string_lossy().into_owned();
    }
    Ok(config)
}

fn open_engine(config: &AppConfig) -> Result<Engine> {
    let engine = Engine::open(config.data_dir(), config.clone())?;
    for (phase, q) in engine.quarantined() {
        eprintln!(
            "warning: phase '{phase}' is quarantined ({}: {})",
            q.path.display(),
            q.reason
        );
    }
    Ok(engine)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_node(config: &AppConfig, action: NodeAction) -> Result<()> {
    let engine = open_engine(config)?;
    let outcome = match action {
        NodeAction::Add {
            phase,
            id,
            node_type,
            label,
            description,
            confidence,
            props,
            evidence,
            created_by,
        } => {
            let mut node = Node::new(id, node_type.as_str(), label, confidence, created_by);
            if let Some(description) = description {
                node = node.with_description(description);
            }
            node.properties.extend(props);
            node.evidence = evidence;
            info!(phase = %phase, node_id = %node.id, "adding node");
            engine.add_node(&phase, node)?
        }
        NodeAction::Update {
            phase,
            id,
            label,
            description,
            confidence,
            props,
            evidence,
        } => {
            let patch = NodePatch {
                label,
                description,
                properties: props.into_iter().collect(),
                confidence,
                evidence,
            };
            if patch.is_empty() {
                return Err(eyre!("nothing to update: pass at least one field"));
            }
            engine.update_node(&phase, &id, patch)?
        }
    };
    print_outcome(&outcome);
    Ok(())
}

fn cmd_issues(config: &AppConfig, filter: &IssueFilter, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let issues = engine.query_issues(filter);

    if json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
        return Ok(());
    }

    println!("{}", format_notification(&issues));
    for issue in &issues {
        print_issue(issue);
    }
    Ok(())
}

fn cmd_resolve(config: &AppConfig, issue: &IssueRef) -> Result<()> {
    let engine = open_engine(config)?;
    let issue_type = IssueType::from(issue.issue_type.as_str());
    match engine.resolve_issue(&issue.phase, &issue.node, &issue_type)? {
        Some(resolved) => {
            println!("Resolved:");
            print_issue(&resolved);
        }
        None => println!(
            "No open {issue_type} issue on '{}' in phase '{}'; nothing to do.",
            issue.node, issue.phase
        ),
    }
    Ok(())
}

fn cmd_assign(config: &AppConfig, issue: &IssueRef, to: Option<&str>) -> Result<()> {
    let engine = open_engine(config)?;
    let issue_type = IssueType::from(issue.issue_type.as_str());
    let assignment = engine.assign_issue(&issue.phase, &issue.node, &issue_type, to)?;
    println!(
        "Assigned {} on '{}' ({}) to {}",
        assignment.issue_type, assignment.node_id, assignment.phase, assignment.resolver
    );
    Ok(())
}

fn cmd_compress(
    config: &AppConfig,
    source_phase: String,
    targets: &[(String, Option<String>)],
    budget: Option<usize>,
    pins: Vec<String>,
) -> Result<()> {
    let targets = targets
        .iter()
        .map(|(phase, profile)| {
            let name = profile.as_deref().unwrap_or(&config.defaults.profile);
            Ok(HandoffTarget::new(phase.clone(), config.profile(name)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let request = HandoffRequest {
        source_phase,
        targets,
        budget: budget.unwrap_or(config.defaults.budget),
        pins,
    };

    let engine = open_engine(config)?;
    let artifacts = engine.compress_for_handoff(&request)?;

    println!();
    for artifact in &artifacts {
        println!(
            "  {} -> {}  [{}]",
            artifact.source_phase, artifact.target_phase, artifact.profile
        );
        println!("    Nodes:  {} (budget {})", artifact.nodes.len(), artifact.budget);
        println!("    Edges:  {}", artifact.edges.len());
        println!("    Digest: {}", artifact.digest);
        for warning in &artifact.warnings {
            println!("    Warning: {warning}");
        }
        let path = engine
            .store()
            .bridge_path(&artifact.source_phase, &artifact.target_phase)?;
        println!("    Path:   {}", path.display());
    }
    println!();
    Ok(())
}

fn cmd_status(config: &AppConfig, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let doc = engine.write_status_document()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Status v{}: {}", doc.version, doc.digest);
    for phase in &doc.phases {
        let archived = if phase.archived { " (archived)" } else { "" };
        println!(
            "  {}{archived}: {} open, {} resolved",
            phase.phase, phase.summary.open, phase.summary.resolved
        );
        for entry in phase.high.iter().chain(&phase.medium).chain(&phase.low) {
            let owner = entry
                .assigned_to
                .as_deref()
                .or(entry.resolver.as_deref())
                .unwrap_or("unrouted");
            println!(
                "    [{}] {} {} ({}) -> {owner}",
                entry.severity, entry.issue_type, entry.node_id, entry.rationale
            );
        }
    }
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_outcome(outcome: &MutationOutcome) {
    println!(
        "#{} {:?} {}",
        outcome.record.seq, outcome.record.kind, outcome.record.subject
    );
    for issue in &outcome.opened {
        print!("  opened ");
        print_issue(issue);
    }
    for issue in &outcome.closed {
        print!("  closed ");
        print_issue(issue);
    }
}

fn print_issue(issue: &Issue) {
    let state = if issue.is_open() { "open" } else { "resolved" };
    println!(
        "[{}] {}/{} {} ({}; {state})",
        issue.severity, issue.phase, issue.node_id, issue.issue_type, issue.rationale
    );
}

// ---------------------------------------------------------------------------
// Argument parsers
// ---------------------------------------------------------------------------

fn parse_severity(s: &str) -> std::result::Result<Severity, String> {
    s.parse()
}

fn parse_property(s: &str) -> std::result::Result<(String, serde_json::Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty property key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn parse_target(s: &str) -> std::result::Result<(String, Option<String>), String> {
    match s.split_once(':') {
        Some((phase, _)) if phase.is_empty() => Err(format!("missing target phase in '{s}'")),
        Some((phase, profile)) if !profile.is_empty() => {
            Ok((phase.to_string(), Some(profile.to_string())))
        }
        Some((phase, _)) => Ok((phase.to_string(), None)),
        None if s.is_empty() => Err("missing target phase".into()),
        None => Ok((s.to_string(), None)),
    }
}
