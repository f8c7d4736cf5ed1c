use cellharness::api::{AgentAdmin, AgentEndpoint, DesiredState, RoutingProbe};
use cellharness::workload::{CompletedWorkload, PlacementRecord, RunState, WorkloadDescriptor};
use cellharness::{Error, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Knobs for how the fake cluster reacts
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Cell the workload is first placed on
    pub initial_cell: String,
    /// Placement queries answered with CLAIMED before RUNNING
    pub claimed_polls: u32,
    pub routing_status: u16,
    /// Routing status once an evacuation has been accepted
    pub routing_after_evacuation: Option<u16>,
    pub evacuate_status: u16,
    /// Move the workload to the other cell on evacuation
    pub relocate_on_evacuate: bool,
    /// How long each stop request hangs before answering
    pub stop_delay: Duration,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            initial_cell: "cell-b".to_string(),
            claimed_polls: 2,
            routing_status: 200,
            routing_after_evacuation: None,
            evacuate_status: 202,
            relocate_on_evacuate: true,
            stop_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Default)]
struct FakeState {
    desired: Vec<WorkloadDescriptor>,
    placement: Option<PlacementRecord>,
    evacuated: Vec<String>,
    completed: Vec<CompletedWorkload>,
}

/// In-process stand-in for the desired-state API, the router and the agents'
/// admin endpoints, all sharing one view of the cluster.
///
/// Accepting an evacuation touches `<marker_dir>/<cell_id>.evacuate`, which
/// the shell agents from [`super::ShellCluster`] wait for before exiting.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    behavior: FakeBehavior,
    marker_dir: PathBuf,
    state: Arc<Mutex<FakeState>>,
    placement_queries: Arc<AtomicU32>,
    stop_requests: Arc<AtomicU32>,
}

impl FakeCluster {
    pub fn new(marker_dir: impl Into<PathBuf>, behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            marker_dir: marker_dir.into(),
            state: Arc::new(Mutex::new(FakeState::default())),
            placement_queries: Arc::new(AtomicU32::new(0)),
            stop_requests: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn desired(&self) -> FakeDesiredState {
        FakeDesiredState(self.clone())
    }

    pub fn routing(&self) -> FakeRoutingProbe {
        FakeRoutingProbe(self.clone())
    }

    pub fn admin(&self) -> Arc<FakeAgentAdmin> {
        Arc::new(FakeAgentAdmin(self.clone()))
    }

    pub fn desired_workloads(&self) -> Vec<WorkloadDescriptor> {
        self.state.lock().unwrap().desired.clone()
    }

    pub fn evacuated_cells(&self) -> Vec<String> {
        self.state.lock().unwrap().evacuated.clone()
    }

    pub fn stop_requests(&self) -> u32 {
        self.stop_requests.load(Ordering::SeqCst)
    }

    pub fn complete_task(&self, task: CompletedWorkload) {
        self.state.lock().unwrap().completed.push(task);
    }

    fn other_cell(cell: &str) -> &'static str {
        if cell == "cell-a" {
            "cell-b"
        } else {
            "cell-a"
        }
    }
}

pub struct FakeDesiredState(FakeCluster);

impl DesiredState for FakeDesiredState {
    async fn desire(&self, workload: &WorkloadDescriptor) -> Result<()> {
        let cluster = &self.0;
        let mut state = cluster.state.lock().unwrap();
        state.desired.push(workload.clone());
        state.placement = Some(PlacementRecord {
            process_guid: workload.process_guid.clone(),
            index: 0,
            instance_guid: "instance-1".to_string(),
            cell_id: cluster.behavior.initial_cell.clone(),
            state: RunState::Unclaimed,
            evacuating: false,
        });
        Ok(())
    }

    async fn placement(&self, process_guid: &str, index: u32) -> Result<PlacementRecord> {
        let cluster = &self.0;
        let queries = cluster.placement_queries.fetch_add(1, Ordering::SeqCst);
        let state = cluster.state.lock().unwrap();

        let mut record = state
            .placement
            .clone()
            .filter(|record| record.process_guid == process_guid && record.index == index)
            .ok_or_else(|| Error::Scenario(format!("no actual LRP {}/{}", process_guid, index)))?;
        if record.state == RunState::Unclaimed {
            record.state = if queries < cluster.behavior.claimed_polls {
                RunState::Claimed
            } else {
                RunState::Running
            };
        }
        Ok(record)
    }

    async fn completed_workloads(&self) -> Result<Vec<CompletedWorkload>> {
        Ok(self.0.state.lock().unwrap().completed.clone())
    }
}

pub struct FakeRoutingProbe(FakeCluster);

impl RoutingProbe for FakeRoutingProbe {
    async fn status(&self) -> Result<u16> {
        let cluster = &self.0;
        let evacuated = !cluster.state.lock().unwrap().evacuated.is_empty();
        Ok(match cluster.behavior.routing_after_evacuation {
            Some(status) if evacuated => status,
            _ => cluster.behavior.routing_status,
        })
    }
}

pub struct FakeAgentAdmin(FakeCluster);

impl AgentAdmin for FakeAgentAdmin {
    async fn evacuate(&self, agent: &AgentEndpoint) -> Result<u16> {
        let cluster = &self.0;
        if cluster.behavior.evacuate_status != 202 {
            return Ok(cluster.behavior.evacuate_status);
        }

        {
            let mut state = cluster.state.lock().unwrap();
            state.evacuated.push(agent.cell_id.clone());
            if let Some(ref mut record) = state.placement {
                if cluster.behavior.relocate_on_evacuate {
                    record.cell_id = FakeCluster::other_cell(&agent.cell_id).to_string();
                    record.state = RunState::Running;
                } else {
                    record.evacuating = true;
                }
            }
        }

        std::fs::write(cluster.marker_dir.join(format!("{}.evacuate", agent.cell_id)), b"")?;
        Ok(202)
    }

    async fn stop_instance(&self, _agent: &AgentEndpoint, _placement: &PlacementRecord) -> Result<()> {
        self.0.stop_requests.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.0.behavior.stop_delay).await;
        Ok(())
    }
}
