use cellharness::scenario::EvacuationVariant;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Orchestrates cluster components and verifies evacuation behavior
#[derive(Parser)]
#[command(name = "cellharness")]
#[command(about = "Orchestrates cluster components and verifies evacuation behavior")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start a cluster, run one scenario against it and tear it down
    Run(RunArgs),

    /// Entry point of generated fault-injection shims
    #[command(name = "fault-shim", hide = true)]
    FaultShim(ShimArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Suite configuration file (TOML)
    #[arg(long)]
    pub config: PathBuf,

    /// Scenario to run
    #[arg(long, value_enum, default_value_t = ScenarioKind::Evacuation)]
    pub scenario: ScenarioKind,

    /// Parallel test node index; overrides ports.node from the configuration
    #[arg(long)]
    pub node: Option<u16>,
}

#[derive(Args)]
pub struct ShimArgs {
    /// Controller socket of the owning injection
    #[arg(long)]
    pub control: PathBuf,

    /// Real binary to exec
    #[arg(long)]
    pub target: PathBuf,

    /// File receiving one trace line per invocation
    #[arg(long)]
    pub trace: PathBuf,

    /// Arguments passed through to the target unchanged
    #[arg(last = true)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Evacuate the cell hosting the workload
    Evacuation,
    /// Evacuate while the container backend's delete hangs
    EvacuationHang,
}

impl From<ScenarioKind> for EvacuationVariant {
    fn from(kind: ScenarioKind) -> Self {
        match kind {
            ScenarioKind::Evacuation => EvacuationVariant::Standard,
            ScenarioKind::EvacuationHang => EvacuationVariant::BackendDeleteHangs,
        }
    }
}
