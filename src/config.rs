//! Suite configuration.
//!
//! One `SuiteConfig` is loaded per harness run and passed by reference to the
//! component factory and every scenario. Durations are integer milliseconds.
//!
//! ```toml
//! [ports]
//! base = 20000
//! per_node = 1000
//! node = 0
//!
//! [endpoints]
//! desired_state_url = "http://127.0.0.1:8889"
//! router_addr = "127.0.0.1:8080"
//!
//! [tls]
//! client_cert = "/certs/client.crt"
//! client_key = "/certs/client.key"
//! ca_cert = "/certs/ca.crt"
//!
//! [components]
//! image_plugin = "/usr/local/bin/grootfs"
//!
//! [components.store]
//! path = "/usr/local/bin/store"
//! args = ["--listen", "127.0.0.1:8889"]
//! readiness = { output = "store.started" }
//! ```

use crate::error::{Error, Result};
use crate::fault::{FaultMatcher, FaultSpec, Trigger};
use crate::environment::Environment;
use crate::polling::Polling;
use crate::process::Readiness;
use crate::workload::DEFAULT_HOST;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    pub endpoints: EndpointsConfig,
    pub tls: TlsConfig,
    pub components: ComponentsConfig,
    #[serde(default)]
    pub fault: Option<FaultConfig>,
    #[serde(default)]
    pub workload: WorkloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortsConfig {
    pub base: u16,
    pub per_node: u16,
    /// Index of this parallel test node; selects a disjoint port window
    pub node: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: crate::port_allocator::DEFAULT_BASE_PORT,
            per_node: crate::port_allocator::DEFAULT_PORTS_PER_NODE,
            node: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    /// Default readiness budget for components without their own
    pub startup_ms: u64,
    /// Budget for the workload to become running and routable
    pub converge_ms: u64,
    pub poll_interval_ms: u64,
    /// Window over which routability must hold after evacuation
    pub consistently_ms: u64,
    /// Agent evacuation timeout; also bounds the wait for its exit
    pub evacuation_ms: u64,
    pub shutdown_grace_ms: u64,
    pub http_ms: u64,
    /// Bound on the agent's exit when its backend is wedged
    pub hung_exit_ms: u64,
    /// Pause between cluster start and desiring the workload in the fault variant
    pub settle_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            startup_ms: 10_000,
            converge_ms: 120_000,
            poll_interval_ms: 500,
            consistently_ms: 2_000,
            evacuation_ms: 30_000,
            shutdown_grace_ms: 5_000,
            http_ms: 5_000,
            hung_exit_ms: 10_000,
            settle_ms: 0,
        }
    }
}

impl TimeoutsConfig {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn evacuation(&self) -> Duration {
        Duration::from_millis(self.evacuation_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn http(&self) -> Duration {
        Duration::from_millis(self.http_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn converge(&self) -> Result<Polling> {
        Polling::from_millis(self.converge_ms, self.poll_interval_ms)
    }

    pub fn evacuation_polling(&self) -> Result<Polling> {
        Polling::from_millis(self.evacuation_ms, self.poll_interval_ms)
    }

    pub fn routing_window(&self) -> Result<Polling> {
        Polling::from_millis(self.consistently_ms, self.poll_interval_ms)
    }

    pub fn hung_exit(&self) -> Duration {
        Duration::from_millis(self.hung_exit_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointsConfig {
    pub desired_state_url: String,
    pub router_addr: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_file_server_addr")]
    pub file_server_addr: String,
}

fn default_virtual_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_file_server_addr() -> String {
    "127.0.0.1:8090".to_string()
}

/// PEM files for the agents' mutual-TLS admin endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub ca_cert: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentsConfig {
    /// Real image plugin the backend invokes, wrapped by the fault variant
    pub image_plugin: PathBuf,
    pub store: ComponentTemplate,
    pub router: ComponentTemplate,
    pub auctioneer: ComponentTemplate,
    pub route_emitter: ComponentTemplate,
    /// Container backend; `{image_plugin}` expands to the (possibly shimmed) plugin
    pub backend: ComponentTemplate,
    /// Worker agent, rendered once per cell
    pub agent: ComponentTemplate,
}

/// How to launch one kind of component. String fields may contain
/// `{placeholder}`s filled in by the component factory.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentTemplate {
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Environment,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default = "default_readiness")]
    pub readiness: Readiness,
    #[serde(default)]
    pub startup_timeout_ms: Option<u64>,
}

fn default_readiness() -> Readiness {
    Readiness::Immediate
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultConfig {
    #[serde(default = "default_fault_verb")]
    pub verb: String,
    #[serde(default = "default_fault_position")]
    pub position: Option<usize>,
    #[serde(default = "default_fault_exclude")]
    pub exclude: Option<String>,
    #[serde(default = "default_fault_delay_ms")]
    pub delay_ms: u64,
    #[serde(default)]
    pub trigger: Trigger,
    /// Executable that serves `fault-shim`; defaults to the running binary
    #[serde(default)]
    pub shim_runner: Option<PathBuf>,
}

fn default_fault_verb() -> String {
    "delete".to_string()
}

fn default_fault_position() -> Option<usize> {
    Some(2)
}

fn default_fault_exclude() -> Option<String> {
    Some("healthcheck".to_string())
}

fn default_fault_delay_ms() -> u64 {
    10_000
}

impl FaultConfig {
    pub fn spec(&self) -> FaultSpec {
        FaultSpec {
            matcher: FaultMatcher {
                verb: self.verb.clone(),
                position: self.position,
                exclude: self.exclude.clone(),
            },
            delay: Duration::from_millis(self.delay_ms),
            trigger: self.trigger,
        }
    }

    pub fn shim_runner(&self) -> Result<PathBuf> {
        match self.shim_runner {
            Some(ref path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// Generated per run when absent
    pub process_guid: Option<String>,
    pub log_guid: String,
    pub instances: u32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            process_guid: None,
            log_guid: "log-guid".to_string(),
            instances: 1,
        }
    }
}

impl SuiteConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        debug!("loaded suite configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SuiteConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timeouts.converge()?;
        self.timeouts.evacuation_polling()?;
        self.timeouts.routing_window()?;

        if u32::from(self.ports.base) + u32::from(self.ports.per_node) * (u32::from(self.ports.node) + 1)
            > u32::from(u16::MAX) + 1
        {
            return Err(Error::Config(format!(
                "port window for node {} does not fit below 65536",
                self.ports.node
            )));
        }
        if !self.endpoints.desired_state_url.starts_with("http://")
            && !self.endpoints.desired_state_url.starts_with("https://")
        {
            return Err(Error::Config(format!(
                "desired_state_url must be an http(s) URL, got '{}'",
                self.endpoints.desired_state_url
            )));
        }
        if self.workload.instances == 0 {
            return Err(Error::Config("workload.instances must be at least 1".to_string()));
        }

        let components = &self.components;
        for (name, template) in [
            ("store", &components.store),
            ("router", &components.router),
            ("auctioneer", &components.auctioneer),
            ("route_emitter", &components.route_emitter),
            ("backend", &components.backend),
            ("agent", &components.agent),
        ] {
            if template.path.as_os_str().is_empty() {
                return Err(Error::Config(format!("components.{}.path is empty", name)));
            }
        }
        Ok(())
    }

    /// Fault settings, required by the hang variant.
    pub fn fault(&self) -> Result<&FaultConfig> {
        self.fault
            .as_ref()
            .ok_or_else(|| Error::Config("missing [fault] section".to_string()))
    }
}
