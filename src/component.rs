use crate::api::AgentEndpoint;
use crate::config::{ComponentTemplate, SuiteConfig};
use crate::error::Result;
use crate::port_allocator::PortAllocator;
use crate::process::{ComponentSpec, Readiness};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-agent values substituted into the agent template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub cell_id: String,
    pub listen_port: u16,
    pub secure_port: u16,
    pub evacuation_timeout: Duration,
    pub graceful_shutdown_interval: Duration,
}

impl AgentSettings {
    /// Overrides how long the agent waits for containers during shutdown.
    pub fn graceful_shutdown_interval(mut self, interval: Duration) -> Self {
        self.graceful_shutdown_interval = interval;
        self
    }

    pub fn evacuation_timeout(mut self, timeout: Duration) -> Self {
        self.evacuation_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> AgentEndpoint {
        AgentEndpoint {
            cell_id: self.cell_id.clone(),
            listen_port: self.listen_port,
            secure_port: self.secure_port,
        }
    }
}

/// Builds component specs from the suite configuration.
///
/// Created once per run and passed by reference into each scenario; it owns
/// the run's port allocator so every scenario draws from the same window.
#[derive(Debug)]
pub struct ComponentFactory<'a> {
    config: &'a SuiteConfig,
    ports: PortAllocator,
}

impl<'a> ComponentFactory<'a> {
    /// Creates a factory over `config`, reserving the node's port window.
    ///
    /// # Arguments
    /// * `config` - Validated suite configuration
    ///
    /// # Returns
    /// * `Ok(ComponentFactory)` - The factory
    /// * `Err(Error::Config)` - The node's port window lies beyond 65535
    pub fn new(config: &'a SuiteConfig) -> Result<Self> {
        let ports = PortAllocator::for_node(config.ports.base, config.ports.per_node, config.ports.node)?;
        Ok(Self { config, ports })
    }

    pub fn config(&self) -> &'a SuiteConfig {
        self.config
    }

    /// Allocator every scenario of this run claims ports from.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn store(&self) -> ComponentSpec {
        self.render("store", &self.config.components.store, &[])
    }

    pub fn router(&self) -> ComponentSpec {
        self.render("router", &self.config.components.router, &[])
    }

    pub fn auctioneer(&self) -> ComponentSpec {
        self.render("auctioneer", &self.config.components.auctioneer, &[])
    }

    pub fn route_emitter(&self) -> ComponentSpec {
        self.render("route-emitter", &self.config.components.route_emitter, &[])
    }

    /// The container backend, pointed at `image_plugin`.
    pub fn backend(&self, image_plugin: &Path) -> ComponentSpec {
        self.render(
            "backend",
            &self.config.components.backend,
            &[("image_plugin", image_plugin.display().to_string())],
        )
    }

    /// Default settings for an agent listening on two consecutive ports.
    ///
    /// # Arguments
    /// * `cell_id` - Identity the agent registers under
    /// * `first_port` - Admin listener port; the secure listener takes the next one
    pub fn agent_settings(&self, cell_id: &str, first_port: u16) -> AgentSettings {
        AgentSettings {
            cell_id: cell_id.to_string(),
            listen_port: first_port,
            secure_port: first_port + 1,
            evacuation_timeout: self.config.timeouts.evacuation(),
            graceful_shutdown_interval: self.config.timeouts.shutdown_grace(),
        }
    }

    /// Renders the agent template for one cell.
    ///
    /// # Arguments
    /// * `settings` - Cell identity, ports and shutdown timings to substitute
    ///
    /// # Returns
    /// A spec named `agent-<cell_id>`
    pub fn agent(&self, settings: &AgentSettings) -> ComponentSpec {
        self.render(
            &format!("agent-{}", settings.cell_id),
            &self.config.components.agent,
            &[
                ("cell_id", settings.cell_id.clone()),
                ("listen_addr", format!("0.0.0.0:{}", settings.listen_port)),
                ("secure_listen_addr", format!("0.0.0.0:{}", settings.secure_port)),
                ("evacuation_timeout", format_duration(settings.evacuation_timeout)),
                (
                    "graceful_shutdown_interval",
                    format_duration(settings.graceful_shutdown_interval),
                ),
            ],
        )
    }

    fn render(&self, name: &str, template: &ComponentTemplate, values: &[(&str, String)]) -> ComponentSpec {
        let node = self.config.ports.node.to_string();
        let fill = |text: &str| {
            values
                .iter()
                .fold(text.replace("{node}", &node), |acc, (key, value)| {
                    acc.replace(&format!("{{{}}}", key), value)
                })
        };

        let readiness = match template.readiness {
            Readiness::Output(ref pattern) => Readiness::Output(fill(pattern)),
            Readiness::Http(ref url) => Readiness::Http(fill(url)),
            ref other => other.clone(),
        };
        let startup_timeout = template
            .startup_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.timeouts.startup());

        let mut spec = ComponentSpec::new(name, PathBuf::from(fill(&template.path.to_string_lossy())))
            .args(template.args.iter().map(|arg| fill(arg)))
            .readiness(readiness)
            .startup_timeout(startup_timeout);
        spec.environment = template.env.map_values(|value| fill(value));
        if let Some(ref dir) = template.working_directory {
            spec = spec.working_directory(fill(&dir.to_string_lossy()));
        }
        spec
    }
}

/// Renders a duration the way Go-style `--flag=30s` / `1ns` options expect.
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}ns", duration.as_nanos())
    }
}
