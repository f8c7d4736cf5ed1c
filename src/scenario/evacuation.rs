//! The evacuation scenario.
//!
//! Stands up a two-cell cluster, places a routable workload, evacuates the
//! cell hosting it and checks that the workload stays routable throughout and
//! that the evacuating agent exits cleanly. The `BackendDeleteHangs` variant
//! wedges the container backend's delete path and checks that the agent still
//! exits within a bounded time.

use super::Cluster;
use crate::api::{is_accepted, is_ok, AgentAdmin, AgentEndpoint, DesiredState, RoutingProbe};
use crate::component::{AgentSettings, ComponentFactory};
use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::group::{GroupOptions, ProcessGroup, StartOrder};
use crate::polling::{ProbeError, ProbeResult, Polling};
use crate::process::{ProcessHandle, SignalKind, KILL_WAIT};
use crate::workload::{generate_guid, PlacementRecord, RunState, WorkloadDescriptor};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const CELL_A: &str = "cell-a";
pub const CELL_B: &str = "cell-b";

/// Stop requests issued against the wedged agent before giving up
const STOP_REQUEST_ATTEMPTS: usize = 100;
const STOP_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// Graceful-shutdown budget for the agent in the hang variant; zero would
/// read as "unset"
const MINIMAL_GRACEFUL_SHUTDOWN: Duration = Duration::from_nanos(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvacuationVariant {
    /// Evacuate whichever cell hosts the workload; it must move and stay routable
    Standard,
    /// Wedge the backend's delete; the evacuating agent must still exit in time
    BackendDeleteHangs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EvacuationPhase {
    Pending,
    ClusterUp,
    WorkloadPlaced,
    WorkloadRunning,
    EvacuationRequested,
    EvacuationInFlight,
    Resolved,
}

impl fmt::Display for EvacuationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a successful run observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvacuationReport {
    pub process_guid: String,
    pub evacuated_cell: String,
    /// Cell reported as hosting the workload after evacuation, when checked
    pub resolved_cell: Option<String>,
    pub agent_exit_code: Option<i32>,
    /// Time from the evacuation request to the agent's exit
    pub agent_exit_after: Duration,
}

struct Agent {
    settings: AgentSettings,
    handle: ProcessHandle,
}

pub struct EvacuationScenario<'a, D, R, A> {
    factory: &'a ComponentFactory<'a>,
    desired: D,
    routing: R,
    admin: Arc<A>,
    variant: EvacuationVariant,
    phase: EvacuationPhase,
}

impl<'a, D, R, A> EvacuationScenario<'a, D, R, A>
where
    D: DesiredState,
    R: RoutingProbe,
    A: AgentAdmin + 'static,
{
    pub fn new(
        factory: &'a ComponentFactory<'a>,
        desired: D,
        routing: R,
        admin: Arc<A>,
        variant: EvacuationVariant,
    ) -> Self {
        Self {
            factory,
            desired,
            routing,
            admin,
            variant,
            phase: EvacuationPhase::Pending,
        }
    }

    /// Last phase entered; after a failure, the phase that failed.
    pub fn phase(&self) -> EvacuationPhase {
        self.phase
    }

    pub fn variant(&self) -> EvacuationVariant {
        self.variant
    }

    /// Runs the scenario and always tears the cluster down afterwards.
    pub async fn run_to_completion(&mut self) -> Result<EvacuationReport> {
        let mut cluster = Cluster::new();
        let outcome = self.run(&mut cluster).await;
        let teardown = cluster
            .teardown(self.factory.config().timeouts.shutdown_grace())
            .await;

        match (outcome, teardown) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_error)) => {
                warn!("teardown after failure also failed: {}", teardown_error);
                Err(e)
            }
        }
    }

    /// Runs the scenario, registering everything it starts in `cluster`.
    ///
    /// The caller owns teardown.
    pub async fn run(&mut self, cluster: &mut Cluster) -> Result<EvacuationReport> {
        info!(variant = ?self.variant, "starting evacuation scenario");
        let outcome = match self.variant {
            EvacuationVariant::Standard => self.standard(cluster).await,
            EvacuationVariant::BackendDeleteHangs => self.backend_delete_hangs(cluster).await,
        };
        match outcome {
            Ok(ref report) => info!(
                "evacuation scenario passed: {} left {} after {:?}",
                report.process_guid, report.evacuated_cell, report.agent_exit_after
            ),
            Err(ref e) => warn!(phase = %self.phase, "evacuation scenario failed: {}", e),
        }
        outcome
    }

    async fn standard(&mut self, cluster: &mut Cluster) -> Result<EvacuationReport> {
        let timeouts = &self.factory.config().timeouts;
        let converge = timeouts.converge()?;
        let evacuation = timeouts.evacuation_polling()?;
        let routing_window = timeouts.routing_window()?;

        let image_plugin = self.factory.config().components.image_plugin.clone();
        let agents = self.cluster_up(cluster, &image_plugin, |settings| settings).await?;

        let workload = self.place_workload().await?;
        let guid = workload.process_guid.clone();

        self.enter(EvacuationPhase::WorkloadRunning);
        converge
            .eventually("workload running", || self.run_state(&guid), |state| *state == RunState::Running)
            .await?;
        converge
            .eventually("workload routable", || self.route_status(), |status| is_ok(*status))
            .await?;

        let placement = self.desired.placement(&guid, 0).await?;
        if placement.evacuating {
            return Err(Error::Scenario(format!(
                "instance {} is already evacuating before evacuation was requested",
                placement.instance_guid
            )));
        }
        let evacuating = agents
            .iter()
            .find(|agent| agent.settings.cell_id == placement.cell_id)
            .ok_or_else(|| {
                Error::Scenario(format!("workload placed on unknown cell '{}'", placement.cell_id))
            })?;

        self.enter(EvacuationPhase::EvacuationRequested);
        let requested_at = Instant::now();
        self.request_evacuation(&evacuating.settings.endpoint()).await?;

        self.enter(EvacuationPhase::EvacuationInFlight);
        let exit_code = evacuation
            .eventually(
                "routable until the evacuating agent exits",
                || self.routable_while_running(&evacuating.handle),
                |code| *code == Some(0),
            )
            .await?;
        let agent_exit_after = requested_at.elapsed();

        self.enter(EvacuationPhase::Resolved);
        Polling::immediate()
            .eventually(
                "workload still running after evacuation",
                || self.run_state(&guid),
                |state| *state == RunState::Running,
            )
            .await?;
        let resolved_cell = match self.desired.placement(&guid, 0).await {
            Ok(record) => {
                info!("workload now hosted on {}", record.cell_id);
                Some(record.cell_id)
            }
            Err(e) => {
                debug!("could not resolve new owner: {}", e);
                None
            }
        };
        routing_window
            .consistently("routable after evacuation", || self.route_status(), |status| is_ok(*status))
            .await?;

        Ok(EvacuationReport {
            process_guid: guid,
            evacuated_cell: placement.cell_id,
            resolved_cell,
            agent_exit_code: exit_code,
            agent_exit_after,
        })
    }

    async fn backend_delete_hangs(&mut self, cluster: &mut Cluster) -> Result<EvacuationReport> {
        let config = self.factory.config();
        let converge = config.timeouts.converge()?;
        let fault_config = config.fault()?;

        let injector = FaultInjector::new(fault_config.shim_runner()?);
        let fault = injector.wrap(&config.components.image_plugin, fault_config.spec())?;
        let shim = cluster.set_fault(fault).shim_path().to_path_buf();

        let [cell_a, cell_b] = self
            .cluster_up(cluster, &shim, |settings| {
                if settings.cell_id == CELL_A {
                    settings.graceful_shutdown_interval(MINIMAL_GRACEFUL_SHUTDOWN)
                } else {
                    settings
                }
            })
            .await?;

        // Only cell A may host the workload
        cell_b.handle.signal(SignalKind::Kill)?;
        if cell_b.handle.wait_timeout(KILL_WAIT).await?.is_none() {
            return Err(Error::Unresponsive {
                component: cell_b.handle.name().to_string(),
                waited: KILL_WAIT,
            });
        }

        let settle = config.timeouts.settle();
        if !settle.is_zero() {
            info!("letting the cluster settle for {:?}", settle);
            tokio::time::sleep(settle).await;
        }

        let workload = self.place_workload().await?;
        let guid = workload.process_guid.clone();

        self.enter(EvacuationPhase::WorkloadRunning);
        converge
            .eventually("workload running", || self.run_state(&guid), |state| *state == RunState::Running)
            .await?;

        self.enter(EvacuationPhase::EvacuationRequested);
        let endpoint = cell_a.settings.endpoint();
        let requested_at = Instant::now();
        self.request_evacuation(&endpoint).await?;

        self.enter(EvacuationPhase::EvacuationInFlight);
        let placement = self.desired.placement(&guid, 0).await?;
        cluster.detach(tokio::spawn(issue_stop_requests(
            Arc::clone(&self.admin),
            endpoint,
            placement.clone(),
        )));

        let hung_exit = config.timeouts.hung_exit();
        let exit = cell_a.handle.wait_timeout(hung_exit).await?.ok_or_else(|| {
            Error::AssertionTimeout {
                description: format!("{} to exit while its backend is wedged", cell_a.handle.name()),
                elapsed: requested_at.elapsed(),
                last_observed: format!("{:?}", cell_a.handle.state()),
            }
        })?;
        let agent_exit_after = requested_at.elapsed();
        info!("{} exited with {} after {:?}", cell_a.handle.name(), exit, agent_exit_after);

        self.enter(EvacuationPhase::Resolved);
        if let Some(fault) = cluster.fault() {
            info!(
                "backend plugin invoked {} time(s), {} delayed",
                fault.invocations(),
                fault.triggered()
            );
        }

        Ok(EvacuationReport {
            process_guid: guid,
            evacuated_cell: placement.cell_id,
            resolved_cell: None,
            agent_exit_code: exit.code,
            agent_exit_after,
        })
    }

    /// Brings up the infrastructure and runtime groups, then both agents.
    async fn cluster_up(
        &mut self,
        cluster: &mut Cluster,
        image_plugin: &std::path::Path,
        customize: impl Fn(AgentSettings) -> AgentSettings,
    ) -> Result<[Agent; 2]> {
        self.enter(EvacuationPhase::ClusterUp);
        let factory = self.factory;
        let grace = factory.config().timeouts.shutdown_grace();

        let infrastructure = ProcessGroup::invoke(
            "infrastructure",
            vec![factory.backend(image_plugin), factory.store()],
            GroupOptions {
                order: StartOrder::Ordered,
                grace,
            },
        )
        .await?;
        cluster.add_group(infrastructure);

        let runtime = ProcessGroup::invoke(
            "runtime",
            vec![factory.router(), factory.auctioneer(), factory.route_emitter()],
            GroupOptions {
                order: StartOrder::Parallel,
                grace,
            },
        )
        .await?;
        cluster.add_group(runtime);

        let first_port = factory.ports().claim_ports(4)?;
        let mut agents = Vec::with_capacity(2);
        for (cell_id, port) in [(CELL_A, first_port), (CELL_B, first_port + 2)] {
            let settings = customize(factory.agent_settings(cell_id, port));
            let handle = cluster.add_agent(ProcessHandle::start(factory.agent(&settings)).await?);
            agents.push(Agent { settings, handle });
        }

        match <[Agent; 2]>::try_from(agents) {
            Ok(agents) => Ok(agents),
            Err(_) => Err(Error::Scenario("expected exactly two agents".to_string())),
        }
    }

    async fn place_workload(&mut self) -> Result<WorkloadDescriptor> {
        self.enter(EvacuationPhase::WorkloadPlaced);
        let config = self.factory.config();
        let process_guid = config
            .workload
            .process_guid
            .clone()
            .unwrap_or_else(generate_guid);
        let workload = WorkloadDescriptor::default_lrp(
            &config.endpoints.file_server_addr,
            &process_guid,
            &config.workload.log_guid,
            config.workload.instances,
        );
        self.desired.desire(&workload).await?;
        info!("desired workload {}", process_guid);
        Ok(workload)
    }

    async fn request_evacuation(&self, agent: &AgentEndpoint) -> Result<()> {
        let status = self.admin.evacuate(agent).await?;
        if !is_accepted(status) {
            return Err(Error::Scenario(format!(
                "evacuating {} returned status {}, expected 202",
                agent.cell_id, status
            )));
        }
        info!("evacuation of {} accepted", agent.cell_id);
        Ok(())
    }

    fn enter(&mut self, phase: EvacuationPhase) {
        info!(phase = %phase, "entering phase");
        self.phase = phase;
    }

    async fn run_state(&self, process_guid: &str) -> ProbeResult<RunState> {
        Ok(self.desired.placement(process_guid, 0).await?.state)
    }

    async fn route_status(&self) -> ProbeResult<u16> {
        Ok(self.routing.status().await?)
    }

    /// The agent's exit code once it has exited; fails the assertion at once
    /// if routing breaks or the agent exits unsuccessfully.
    async fn routable_while_running(&self, agent: &ProcessHandle) -> ProbeResult<Option<i32>> {
        let status = self
            .routing
            .status()
            .await
            .map_err(|e| ProbeError::fatal(format!("routing probe failed: {}", e)))?;
        if !is_ok(status) {
            return Err(ProbeError::fatal(format!("routing returned {}", status)));
        }

        match agent.try_exit() {
            None => Ok(None),
            Some(exit) if exit.success() => Ok(Some(0)),
            Some(exit) => Err(ProbeError::fatal(format!("{} exited with {}", agent.name(), exit))),
        }
    }
}

/// Repeatedly asks the agent to stop the instance, the way a client retries
/// against a dependency that no longer answers. Stops at the first error.
async fn issue_stop_requests<A: AgentAdmin>(admin: Arc<A>, agent: AgentEndpoint, placement: PlacementRecord) {
    for attempt in 1..=STOP_REQUEST_ATTEMPTS {
        if let Err(e) = admin.stop_instance(&agent, &placement).await {
            debug!("stop request {} against {} ended: {}", attempt, agent.cell_id, e);
            return;
        }
        tokio::time::sleep(STOP_REQUEST_INTERVAL).await;
    }
}
