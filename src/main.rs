type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod signals;

use std::sync::Arc;

use cellharness::api::{HttpDesiredState, HttpRoutingProbe, TlsAgentAdmin};
use cellharness::component::ComponentFactory;
use cellharness::config::SuiteConfig;
use cellharness::fault::run_shim;
use cellharness::scenario::{Cluster, EvacuationScenario};
use clap::Parser;
use eyre::eyre;
use tokio::select;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command, RunArgs, ShimArgs};
use signals::Signals;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Shims must leave the wrapped binary's streams untouched, so this
        // path installs neither hooks nor a subscriber.
        Command::FaultShim(args) => shim(args),
        Command::Run(args) => {
            color_eyre::install()?;

            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(EnvFilter::from_default_env())
                .init();

            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
                .block_on(run(args))
        }
    }
}

fn shim(args: ShimArgs) -> Result<()> {
    let error = run_shim(&args.control, &args.target, &args.trace, args.args);
    eprintln!("cellharness fault-shim: {}", error);
    std::process::exit(127);
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = SuiteConfig::load(&args.config)?;
    if let Some(node) = args.node {
        config.ports.node = node;
        config.validate()?;
    }
    let config = config;

    let factory = ComponentFactory::new(&config)?;
    let timeouts = &config.timeouts;
    let desired = HttpDesiredState::new(&config.endpoints.desired_state_url, timeouts.http())?;
    let routing = HttpRoutingProbe::new(&config.endpoints.router_addr, &config.endpoints.virtual_host)?;
    let admin = TlsAgentAdmin::from_files(
        &config.tls.client_cert,
        &config.tls.client_key,
        &config.tls.ca_cert,
        timeouts.http(),
    )?;

    let mut scenario = EvacuationScenario::new(
        &factory,
        desired,
        routing,
        Arc::new(admin),
        args.scenario.into(),
    );
    let mut signals = Signals::new()?;
    let mut cluster = Cluster::new();

    info!(
        "cellharness running {:?} on node {} ({} ports available)",
        args.scenario,
        config.ports.node,
        factory.ports().remaining()
    );

    let outcome = select! {
        outcome = scenario.run(&mut cluster) => Some(outcome),
        _ = signals.next() => None,
    };
    let outcome = match outcome {
        Some(outcome) => outcome.map_err(eyre::Report::from),
        None => {
            warn!("interrupted during {}, tearing down", scenario.phase());
            Err(eyre!("interrupted during {}", scenario.phase()))
        }
    };

    let teardown = cluster.teardown(timeouts.shutdown_grace()).await;
    if let Err(ref e) = teardown {
        error!("teardown failed: {}", e);
    }

    let report = outcome?;
    teardown?;
    info!(
        "evacuated {} from {} in {:?} (exit code {:?}, now on {})",
        report.process_guid,
        report.evacuated_cell,
        report.agent_exit_after,
        report.agent_exit_code,
        report.resolved_cell.as_deref().unwrap_or("unknown")
    );
    Ok(())
}
