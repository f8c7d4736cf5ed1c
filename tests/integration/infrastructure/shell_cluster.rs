use anyhow::{Context, Result};
use cellharness::config::SuiteConfig;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use tempfile::TempDir;

/// Each test gets its own port window, as parallel nodes would
static NEXT_NODE: AtomicU16 = AtomicU16::new(0);

/// Agent stand-in: announces readiness, waits for its evacuation marker, then
/// drains briefly and exits 0. Its environment is recorded for inspection.
const AGENT_SCRIPT: &str = r#"#!/bin/sh
cell="$1"
dir="$2"
echo "GRACEFUL_SHUTDOWN_INTERVAL=$GRACEFUL_SHUTDOWN_INTERVAL" > "$dir/$cell.env"
echo "agent $cell started"
while [ ! -f "$dir/$cell.evacuate" ]; do
  sleep 0.05
done
echo "agent $cell evacuating"
sleep 0.2
exit 0
"#;

const IMAGE_PLUGIN_SCRIPT: &str = "#!/bin/sh\necho \"grootfs $*\"\n";

/// A cluster of `/bin/sh` stand-ins plus the suite configuration that
/// launches them.
pub struct ShellCluster {
    dir: TempDir,
    failing: Option<&'static str>,
    fault: bool,
}

impl ShellCluster {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().context("Failed to create cluster directory")?;
        write_executable(&dir.path().join("agent.sh"), AGENT_SCRIPT)?;
        write_executable(&dir.path().join("grootfs"), IMAGE_PLUGIN_SCRIPT)?;
        Ok(Self {
            dir,
            failing: None,
            fault: false,
        })
    }

    /// Makes one component exit with status 3 instead of becoming ready.
    pub fn failing(mut self, component: &'static str) -> Self {
        self.failing = Some(component);
        self
    }

    /// Adds a `[fault]` section served by the compiled harness binary.
    pub fn with_fault(mut self) -> Self {
        self.fault = true;
        self
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn image_plugin(&self) -> PathBuf {
        self.dir.path().join("grootfs")
    }

    /// Plugin path the backend was started with.
    pub fn backend_plugin(&self) -> Result<String> {
        let recorded = fs::read_to_string(self.dir.path().join("backend_plugin"))
            .context("backend never recorded its plugin")?;
        Ok(recorded.trim().to_string())
    }

    pub fn agent_env(&self, cell: &str) -> Result<String> {
        fs::read_to_string(self.dir.path().join(format!("{}.env", cell)))
            .with_context(|| format!("agent {} never recorded its environment", cell))
    }

    pub fn config(&self) -> Result<SuiteConfig> {
        let node = NEXT_NODE.fetch_add(1, Ordering::SeqCst);
        let dir = self.dir.path().display().to_string();

        let mut toml = format!(
            r#"
[ports]
base = 30000
per_node = 100
node = {node}

[timeouts]
startup_ms = 5000
converge_ms = 5000
poll_interval_ms = 50
consistently_ms = 300
evacuation_ms = 5000
shutdown_grace_ms = 2000
hung_exit_ms = 10000

[endpoints]
desired_state_url = "http://127.0.0.1:1"
router_addr = "127.0.0.1:1"

[tls]
client_cert = "{dir}/client.crt"
client_key = "{dir}/client.key"
ca_cert = "{dir}/ca.crt"

[components]
image_plugin = "{dir}/grootfs"
{store}
{router}
{auctioneer}
{route_emitter}

[components.backend]
path = "/bin/sh"
args = ["-c", "echo \"$1\" > {dir}/backend_plugin; echo backend started; exec sleep 300", "backend", "{{image_plugin}}"]
readiness = {{ output = "backend started" }}

[components.agent]
path = "/bin/sh"
args = ["{dir}/agent.sh", "{{cell_id}}", "{dir}"]
env = {{ GRACEFUL_SHUTDOWN_INTERVAL = "{{graceful_shutdown_interval}}" }}
readiness = {{ output = "agent {{cell_id}} started" }}
"#,
            node = node,
            dir = dir,
            store = self.service("store"),
            router = self.service("router"),
            auctioneer = self.service("auctioneer"),
            route_emitter = self.service("route_emitter"),
        );

        if self.fault {
            toml.push_str(&format!(
                "\n[fault]\ndelay_ms = 1000\nshim_runner = \"{}\"\n",
                env!("CARGO_BIN_EXE_cellharness")
            ));
        }

        Ok(SuiteConfig::from_toml_str(&toml)?)
    }

    fn service(&self, name: &str) -> String {
        let script = if self.failing == Some(name) {
            format!("echo {} cannot bind; exit 3", name)
        } else {
            format!("echo {} started; exec sleep 300", name)
        };
        format!(
            "\n[components.{name}]\npath = \"/bin/sh\"\nargs = [\"-c\", \"{script}\"]\nreadiness = {{ output = \"{name} started\" }}\n",
            name = name,
            script = script
        )
    }
}

pub fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}
