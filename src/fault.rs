//! Fault injection by substituting a dependency binary with a shim.
//!
//! [`FaultInjector::wrap`] writes an executable shim script that re-enters this
//! binary in `fault-shim` mode. The shim asks the injection's in-process
//! controller, over a private Unix socket, how long to stall the current
//! invocation, appends a trace line, sleeps, then `exec`s the real binary with
//! the same arguments. Streams and exit code therefore belong to the real
//! binary.
//!
//! The one-shot decision is a compare-exchange on an `AtomicBool` owned by the
//! controller, so concurrent shim invocations racing on a matching call delay
//! exactly one of them.

use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

/// Name of the hidden subcommand generated shims invoke
pub const SHIM_SUBCOMMAND: &str = "fault-shim";

/// How long a shim waits for the controller's answer before running unfaulted
const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_CONTROL_LINE: usize = 1024 * 1024;

/// Selects the invocations a fault applies to.
///
/// Wrapped plugins are invoked as `<plugin> <global-flags...> <verb> <args...>`;
/// a matcher names the verb, optionally pins its position, and optionally
/// exempts invocations whose first verb argument contains a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FaultMatcher {
    pub verb: String,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub exclude: Option<String>,
}

impl FaultMatcher {
    pub fn verb(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            position: None,
            exclude: None,
        }
    }

    /// Requires the verb at this zero-based argument index.
    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Skips invocations whose argument after the verb contains `pattern`.
    pub fn excluding(mut self, pattern: impl Into<String>) -> Self {
        self.exclude = Some(pattern.into());
        self
    }

    pub fn matches(&self, args: &[String]) -> bool {
        let verb_index = match self.position {
            Some(position) => args
                .get(position)
                .filter(|arg| **arg == self.verb)
                .map(|_| position),
            None => args.iter().position(|arg| *arg == self.verb),
        };
        let Some(verb_index) = verb_index else {
            return false;
        };

        match self.exclude {
            Some(ref pattern) => !args
                .get(verb_index + 1)
                .is_some_and(|arg| arg.contains(pattern.as_str())),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// At most once per injection
    #[default]
    OneShot,
    /// Every matching invocation
    Repeating,
}

/// A matcher plus the behavior injected into matching invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultSpec {
    pub matcher: FaultMatcher,
    pub delay: Duration,
    pub trigger: Trigger,
}

impl FaultSpec {
    pub fn one_shot(matcher: FaultMatcher, delay: Duration) -> Self {
        Self {
            matcher,
            delay,
            trigger: Trigger::OneShot,
        }
    }

    pub fn repeating(matcher: FaultMatcher, delay: Duration) -> Self {
        Self {
            matcher,
            delay,
            trigger: Trigger::Repeating,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ShimRequest {
    args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShimReply {
    delay_ms: u64,
}

#[derive(Debug)]
struct FaultState {
    spec: FaultSpec,
    fired: AtomicBool,
    invocations: AtomicU32,
    triggered: AtomicU32,
}

impl FaultState {
    fn new(spec: FaultSpec) -> Self {
        Self {
            spec,
            fired: AtomicBool::new(false),
            invocations: AtomicU32::new(0),
            triggered: AtomicU32::new(0),
        }
    }

    /// Delay to apply to one invocation with `args`.
    fn decide(&self, args: &[String]) -> Duration {
        self.invocations.fetch_add(1, Ordering::AcqRel);
        if !self.spec.matcher.matches(args) {
            return Duration::ZERO;
        }

        let fires = match self.spec.trigger {
            Trigger::OneShot => self
                .fired
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Trigger::Repeating => true,
        };
        if !fires {
            return Duration::ZERO;
        }
        self.triggered.fetch_add(1, Ordering::AcqRel);
        self.spec.delay
    }
}

/// Builds shims around dependency binaries.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    shim_runner: PathBuf,
}

impl FaultInjector {
    /// `shim_runner` is the `cellharness` executable the shim re-enters.
    pub fn new(shim_runner: impl Into<PathBuf>) -> Self {
        Self {
            shim_runner: shim_runner.into(),
        }
    }

    /// Wraps `target` with a shim applying `spec`.
    ///
    /// Must be called inside a Tokio runtime; the controller runs as a task
    /// for as long as the returned injection lives.
    pub fn wrap(&self, target: &Path, spec: FaultSpec) -> Result<FaultInjection> {
        let setup_error = |reason: String| Error::FaultInjectionSetup {
            target: target.to_path_buf(),
            reason,
        };

        if !target.is_file() {
            return Err(setup_error("target binary does not exist".to_string()));
        }
        if !self.shim_runner.is_file() {
            return Err(setup_error(format!(
                "shim runner {} does not exist",
                self.shim_runner.display()
            )));
        }

        let dir = tempfile::Builder::new()
            .prefix("cellharness-fault-")
            .tempdir()
            .map_err(|e| setup_error(format!("fixture directory: {}", e)))?;
        let control_path = dir.path().join("control.sock");
        let trace_path = dir.path().join("trace");
        let shim_name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shim".to_string());
        let shim_dir = dir.path().join("bin");
        fs::create_dir(&shim_dir).map_err(|e| setup_error(format!("shim directory: {}", e)))?;
        let shim_path = shim_dir.join(shim_name);

        let listener = UnixListener::bind(&control_path)
            .map_err(|e| setup_error(format!("bind {}: {}", control_path.display(), e)))?;

        let script = format!(
            "#!/bin/sh\nexec {} {} --control {} --target {} --trace {} -- \"$@\"\n",
            shell_quote(&self.shim_runner),
            SHIM_SUBCOMMAND,
            shell_quote(&control_path),
            shell_quote(target),
            shell_quote(&trace_path),
        );
        fs::write(&shim_path, script).map_err(|e| setup_error(format!("write shim: {}", e)))?;
        fs::set_permissions(&shim_path, fs::Permissions::from_mode(0o755))
            .map_err(|e| setup_error(format!("chmod shim: {}", e)))?;

        let state = Arc::new(FaultState::new(spec));
        let controller = tokio::spawn(serve(listener, Arc::clone(&state)));

        info!(
            "wrapped {} with fault shim {} ({:?} {:?} on '{}')",
            target.display(),
            shim_path.display(),
            state.spec.trigger,
            state.spec.delay,
            state.spec.matcher.verb
        );

        Ok(FaultInjection {
            target: target.to_path_buf(),
            shim_path,
            trace_path,
            state,
            controller,
            _dir: dir,
        })
    }
}

/// An installed shim. Dropping it stops the controller and removes the shim,
/// its socket and its trace file.
#[derive(Debug)]
pub struct FaultInjection {
    target: PathBuf,
    shim_path: PathBuf,
    trace_path: PathBuf,
    state: Arc<FaultState>,
    controller: JoinHandle<()>,
    _dir: TempDir,
}

impl FaultInjection {
    /// Executable to configure in place of the target.
    pub fn shim_path(&self) -> &Path {
        &self.shim_path
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn trace_path(&self) -> &Path {
        &self.trace_path
    }

    /// Invocations the controller has answered.
    pub fn invocations(&self) -> u32 {
        self.state.invocations.load(Ordering::Acquire)
    }

    /// Invocations that received the injected delay.
    pub fn triggered(&self) -> u32 {
        self.state.triggered.load(Ordering::Acquire)
    }

    /// Trace lines written so far, one per shim invocation.
    pub fn trace_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.trace_path) {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for FaultInjection {
    fn drop(&mut self) {
        self.controller.abort();
    }
}

async fn serve(listener: UnixListener, state: Arc<FaultState>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = answer(stream, &state).await {
                        warn!("fault controller: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("fault controller accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn answer(stream: UnixStream, state: &FaultState) -> Result<()> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_CONTROL_LINE));

    let Some(line) = framed.next().await else {
        return Ok(());
    };
    let line = line.map_err(std::io::Error::other)?;
    let request: ShimRequest = serde_json::from_str(&line)?;

    let delay = state.decide(&request.args);
    if delay.is_zero() {
        debug!("shim invocation passes through: {:?}", request.args);
    } else {
        info!("injecting {:?} delay into {:?}", delay, request.args);
    }

    let reply = serde_json::to_string(&ShimReply {
        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
    })?;
    framed.send(reply).await.map_err(std::io::Error::other)?;
    Ok(())
}

/// Blocking client side used by the shim process.
fn request_delay(control: &Path, args: &[String]) -> std::io::Result<Duration> {
    let mut stream = StdUnixStream::connect(control)?;
    stream.set_read_timeout(Some(CONTROL_REPLY_TIMEOUT))?;
    stream.set_write_timeout(Some(CONTROL_REPLY_TIMEOUT))?;

    let mut request = serde_json::to_string(&ShimRequest {
        args: args.to_vec(),
    })?;
    request.push('\n');
    stream.write_all(request.as_bytes())?;

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    let reply: ShimReply = serde_json::from_str(line.trim_end())?;
    Ok(Duration::from_millis(reply.delay_ms))
}

/// Body of the `fault-shim` subcommand.
///
/// Writes nothing to stdout or stderr: the trace goes to `trace`. Returns
/// only if `target` cannot be executed.
pub fn run_shim(control: &Path, target: &Path, trace: &Path, args: Vec<String>) -> Error {
    let (delay, note) = match request_delay(control, &args) {
        Ok(delay) => (delay, None),
        Err(e) => (Duration::ZERO, Some(format!("controller unavailable: {}", e))),
    };

    let mut line = format!("{} {}", chrono::Utc::now().timestamp(), args.join(" "));
    if !delay.is_zero() {
        line.push_str(&format!(" [delayed {}ms]", delay.as_millis()));
    }
    if let Some(note) = note {
        line.push_str(&format!(" [{}]", note));
    }
    line.push('\n');
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(trace) {
        // O_APPEND keeps concurrent shims' lines whole
        let _ = file.write_all(line.as_bytes());
    }

    if !delay.is_zero() {
        std::thread::sleep(delay);
    }

    let exec_error = std::process::Command::new(target).args(&args).exec();
    Error::FaultInjectionSetup {
        target: target.to_path_buf(),
        reason: format!("exec failed: {}", exec_error),
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}
