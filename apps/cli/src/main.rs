//! PhaseGraph CLI: knowledge graph quality and handoff compression.
//!
//! Records nodes and edges into per-phase graphs, reports the quality issues
//! detected on them, and compresses a phase into bridge artifacts for the
//! phases that follow.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli)
}
