//! End-to-end scenarios composed from groups, handles, assertions and faults.

pub mod evacuation;
pub mod task;

pub use evacuation::{EvacuationPhase, EvacuationReport, EvacuationScenario, EvacuationVariant};
pub use task::await_task_completion;

use crate::error::Result;
use crate::fault::FaultInjection;
use crate::group::{stop_processes, ProcessGroup, Supervised};
use crate::process::ProcessHandle;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything a scenario started and must stop.
///
/// Owned outside the scenario's future so a cancelled run (Ctrl-C, a failed
/// step) can still be torn down gracefully.
#[derive(Debug, Default)]
pub struct Cluster {
    groups: Vec<ProcessGroup>,
    agents: Vec<ProcessHandle>,
    fault: Option<FaultInjection>,
    background: Vec<JoinHandle<()>>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: ProcessGroup) {
        self.groups.push(group);
    }

    pub fn add_agent(&mut self, agent: ProcessHandle) -> ProcessHandle {
        self.agents.push(agent.clone());
        agent
    }

    pub fn set_fault(&mut self, fault: FaultInjection) -> &FaultInjection {
        self.fault.insert(fault)
    }

    pub fn fault(&self) -> Option<&FaultInjection> {
        self.fault.as_ref()
    }

    /// Tracks a best-effort background task; it is aborted at teardown if
    /// still running.
    pub fn detach(&mut self, task: JoinHandle<()>) {
        self.background.push(task);
    }

    pub fn groups(&self) -> &[ProcessGroup] {
        &self.groups
    }

    pub fn agents(&self) -> &[ProcessHandle] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.agents.is_empty()
    }

    /// Stops every group and agent concurrently, then drops fault fixtures.
    ///
    /// Idempotent: a second call finds nothing left to stop.
    pub async fn teardown(&mut self, grace: Duration) -> Result<()> {
        for task in self.background.drain(..) {
            if !task.is_finished() {
                task.abort();
            }
        }

        if !self.is_empty() {
            info!(
                "tearing down {} group(s) and {} agent(s)",
                self.groups.len(),
                self.agents.len()
            );
        }
        let members: Vec<&dyn Supervised> = self
            .groups
            .iter()
            .map(|group| group as &dyn Supervised)
            .chain(self.agents.iter().map(|agent| agent as &dyn Supervised))
            .collect();
        let outcome = stop_processes(&members, grace).await;
        if let Err(ref e) = outcome {
            warn!("teardown incomplete: {}", e);
        }

        for group in &self.groups {
            // Members are already stopped; this only records the state
            if let Err(e) = group.shutdown().await {
                warn!(group = %group.name(), "{}", e);
            }
        }
        self.groups.clear();
        self.agents.clear();
        self.fault = None;
        outcome
    }
}
