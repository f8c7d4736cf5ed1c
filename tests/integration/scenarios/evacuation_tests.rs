use crate::integration::infrastructure::{FakeBehavior, FakeCluster, ShellCluster};
use anyhow::Result;
use cellharness::component::ComponentFactory;
use cellharness::scenario::{Cluster, EvacuationPhase, EvacuationScenario, EvacuationVariant};
use cellharness::Error;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::time::Duration;

fn is_gone(pid: Pid) -> bool {
    kill(pid, None).is_err()
}

/// The workload starts on cell-b, is evacuated, moves to cell-a and stays
/// routable throughout
#[tokio::test]
async fn test_standard_evacuation() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let shell = ShellCluster::new()?;
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(shell.path(), FakeBehavior::default());

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::Standard,
    );
    let report = scenario.run_to_completion().await?;

    assert_eq!(scenario.phase(), EvacuationPhase::Resolved);
    assert_eq!(report.evacuated_cell, "cell-b");
    assert_eq!(report.resolved_cell.as_deref(), Some("cell-a"));
    assert_eq!(report.agent_exit_code, Some(0));
    assert_eq!(fake.evacuated_cells(), vec!["cell-b".to_string()]);

    let desired = fake.desired_workloads();
    assert_eq!(desired.len(), 1);
    assert_eq!(desired[0].process_guid, report.process_guid);
    assert_eq!(shell.backend_plugin()?, shell.image_plugin().display().to_string());
    assert!(shell.agent_env("cell-a")?.contains("GRACEFUL_SHUTDOWN_INTERVAL=2s"));
    Ok(())
}

/// Anything other than 202 from the admin endpoint fails the scenario at once
#[tokio::test]
async fn test_rejected_evacuation_fails_and_tears_down() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let shell = ShellCluster::new()?;
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(
        shell.path(),
        FakeBehavior {
            evacuate_status: 403,
            ..FakeBehavior::default()
        },
    );

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::Standard,
    );
    let mut cluster = Cluster::new();
    let err = scenario.run(&mut cluster).await.unwrap_err();

    assert_eq!(scenario.phase(), EvacuationPhase::EvacuationRequested);
    assert!(matches!(err, Error::Scenario(ref msg) if msg.contains("403")), "{}", err);

    let pids: Vec<Pid> = cluster
        .groups()
        .iter()
        .flat_map(|group| group.members().iter().map(|member| member.pid()))
        .chain(cluster.agents().iter().map(|agent| agent.pid()))
        .collect();
    assert_eq!(pids.len(), 7);
    assert!(pids.iter().all(|pid| !is_gone(*pid)));

    cluster.teardown(Duration::from_secs(2)).await?;
    for pid in pids {
        assert!(is_gone(pid), "pid {} survived teardown", pid);
    }
    assert!(cluster.is_empty());
    Ok(())
}

/// Losing routability while the agent drains is a violation, not a retry
#[tokio::test]
async fn test_routing_loss_during_evacuation_fails_fast() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let shell = ShellCluster::new()?;
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(
        shell.path(),
        FakeBehavior {
            routing_after_evacuation: Some(502),
            ..FakeBehavior::default()
        },
    );

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::Standard,
    );
    let err = scenario.run_to_completion().await.unwrap_err();

    assert_eq!(scenario.phase(), EvacuationPhase::EvacuationInFlight);
    match err {
        Error::ConsistencyViolation { observed, elapsed, .. } => {
            assert!(observed.contains("502"));
            assert!(elapsed < Duration::from_secs(5));
        }
        other => panic!("expected a consistency violation, got {:?}", other),
    }
    Ok(())
}

/// A component failing to start aborts before anything is desired
#[tokio::test]
async fn test_cluster_up_failure_attempts_no_assertions() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let shell = ShellCluster::new()?.failing("auctioneer");
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(shell.path(), FakeBehavior::default());

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::Standard,
    );
    let mut cluster = Cluster::new();
    let err = scenario.run(&mut cluster).await.unwrap_err();

    assert_eq!(scenario.phase(), EvacuationPhase::ClusterUp);
    match err {
        Error::Startup {
            component,
            output_tail,
            ..
        } => {
            assert_eq!(component, "auctioneer");
            assert!(output_tail.iter().any(|line| line.contains("cannot bind")));
        }
        other => panic!("expected a startup error, got {:?}", other),
    }
    assert!(fake.desired_workloads().is_empty());
    // The infrastructure group formed before the runtime group failed
    assert_eq!(cluster.groups().len(), 1);
    assert!(cluster.agents().is_empty());

    cluster.teardown(Duration::from_secs(2)).await?;
    Ok(())
}

/// With the backend's delete wedged and stop requests hanging, the evacuating
/// agent still exits within the bound
#[tokio::test]
async fn test_agent_exits_despite_wedged_backend() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let shell = ShellCluster::new()?.with_fault();
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(
        shell.path(),
        FakeBehavior {
            initial_cell: "cell-a".to_string(),
            relocate_on_evacuate: false,
            stop_delay: Duration::from_secs(60),
            ..FakeBehavior::default()
        },
    );

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::BackendDeleteHangs,
    );
    let report = scenario.run_to_completion().await?;

    assert_eq!(scenario.phase(), EvacuationPhase::Resolved);
    assert_eq!(report.evacuated_cell, "cell-a");
    assert!(report.agent_exit_after < Duration::from_secs(10));
    assert!(fake.stop_requests() >= 1, "background stop requests never started");

    // The backend ran against the shim, not the real plugin
    let plugin = shell.backend_plugin()?;
    assert_ne!(plugin, shell.image_plugin().display().to_string());
    assert!(plugin.ends_with("/grootfs"));
    assert!(shell.agent_env("cell-a")?.contains("GRACEFUL_SHUTDOWN_INTERVAL=1ns"));
    Ok(())
}

#[tokio::test]
async fn test_hang_variant_requires_fault_section() -> Result<()> {
    let shell = ShellCluster::new()?;
    let config = shell.config()?;
    let factory = ComponentFactory::new(&config)?;
    let fake = FakeCluster::new(shell.path(), FakeBehavior::default());

    let mut scenario = EvacuationScenario::new(
        &factory,
        fake.desired(),
        fake.routing(),
        fake.admin(),
        EvacuationVariant::BackendDeleteHangs,
    );
    let err = scenario.run_to_completion().await.unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(scenario.phase(), EvacuationPhase::Pending);
    Ok(())
}
