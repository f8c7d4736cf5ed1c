//! Workload descriptors submitted to the desired-state API and the records it
//! reports back.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Virtual host every default workload is routed under
pub const DEFAULT_HOST: &str = "lrp-route";

pub const DEFAULT_DOMAIN: &str = "cellharness";

pub fn generate_guid() -> String {
    Uuid::new_v4().to_string()
}

/// One step a workload performs, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Download {
        from: String,
        to: String,
    },
    Run {
        path: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<(String, String)>,
    },
    Upload {
        from: String,
        to: String,
    },
    FetchResult {
        file: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hostnames: Vec<String>,
    pub port: u16,
}

/// A long-running workload as submitted to the desired-state API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub process_guid: String,
    pub log_guid: String,
    pub domain: String,
    pub instances: u32,
    pub memory_mb: u32,
    pub disk_mb: u32,
    pub ports: Vec<u16>,
    pub routes: Vec<Route>,
    pub actions: Vec<Action>,
}

impl WorkloadDescriptor {
    /// The single routable app every scenario desires: downloads the app
    /// archive from the file server and runs it on port 8080 under
    /// [`DEFAULT_HOST`].
    pub fn default_lrp(file_server: &str, process_guid: &str, log_guid: &str, instances: u32) -> Self {
        Self {
            process_guid: process_guid.to_string(),
            log_guid: log_guid.to_string(),
            domain: DEFAULT_DOMAIN.to_string(),
            instances,
            memory_mb: 128,
            disk_mb: 1024,
            ports: vec![8080],
            routes: vec![Route {
                hostnames: vec![DEFAULT_HOST.to_string()],
                port: 8080,
            }],
            actions: vec![
                Action::Download {
                    from: format!("http://{}/v1/static/lrp.zip", file_server),
                    to: "/tmp".to_string(),
                },
                Action::Run {
                    path: "/tmp/go-server".to_string(),
                    args: Vec::new(),
                    env: vec![("PORT".to_string(), "8080".to_string())],
                },
            ],
        }
    }
}

/// Run state of one workload instance as the desired-state store reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Unclaimed,
    Claimed,
    Running,
    Crashed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Unclaimed => "UNCLAIMED",
            RunState::Claimed => "CLAIMED",
            RunState::Running => "RUNNING",
            RunState::Crashed => "CRASHED",
        };
        f.write_str(name)
    }
}

/// Where one instance of a workload currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub process_guid: String,
    pub index: u32,
    pub instance_guid: String,
    pub cell_id: String,
    pub state: RunState,
    #[serde(default)]
    pub evacuating: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedWorkload {
    pub task_guid: String,
    pub failed: bool,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub result: String,
}
