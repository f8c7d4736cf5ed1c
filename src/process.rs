use crate::environment::Environment;
use crate::error::{Error, Result};
use futures::future::join_all;
use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Startup budget used when a spec does not set one
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for a process to disappear after SIGKILL
pub const KILL_WAIT: Duration = Duration::from_secs(5);

/// Output lines retained per process for failure diagnostics
const OUTPUT_TAIL_LINES: usize = 50;

/// Longest output line forwarded to the log before the stream is only drained
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Spacing between health probes for HTTP and TCP readiness
const READINESS_PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// How long an exit waits for the output scanners to reach end of stream
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(250);

/// How a component announces that it is ready to serve.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// A line on stdout or stderr contains this text
    Output(String),
    /// A GET against this URL returns a 2xx status
    Http(String),
    /// A TCP connection to this address succeeds
    Tcp(SocketAddr),
    /// Ready as soon as the process is spawned
    Immediate,
}

/// Immutable description of one orchestrated process.
#[derive(Debug, Clone)]
pub struct ComponentSpec {
    /// Name used in logs and errors
    pub name: String,
    /// Executable to launch
    pub command: PathBuf,
    /// Ordered arguments
    pub args: Vec<String>,
    /// Overrides on top of the harness environment
    pub environment: Environment,
    /// Working directory for the process
    pub working_directory: Option<PathBuf>,
    /// Readiness predicate
    pub readiness: Readiness,
    /// Budget for readiness to be observed
    pub startup_timeout: Duration,
}

impl ComponentSpec {
    /// Creates a spec with no arguments, no overrides and immediate readiness.
    ///
    /// # Arguments
    /// * `name` - Component name used in logs and errors
    /// * `command` - Executable to launch
    ///
    /// # Examples
    /// ```
    /// use cellharness::{ComponentSpec, Readiness};
    ///
    /// let spec = ComponentSpec::new("store", "/usr/local/bin/store")
    ///     .args(["--listen", "127.0.0.1:2379"])
    ///     .readiness(Readiness::Output("listening".to_string()));
    /// assert_eq!(spec.args.len(), 2);
    /// ```
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            environment: Environment::new(),
            working_directory: None,
            readiness: Readiness::Immediate,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    /// Appends arguments after any already present.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds one environment override.
    ///
    /// # Arguments
    /// * `key` - The environment variable name
    /// * `value` - The value the component will see
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.set(key, value);
        self
    }

    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Sets how long `ProcessHandle::start` waits for readiness before
    /// killing the process.
    pub fn startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Signals the harness delivers to components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Kill,
}

impl SignalKind {
    pub fn as_nix(self) -> Signal {
        match self {
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::Kill => Signal::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        self.as_nix().as_str()
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed by one
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Outcome recorded when the OS wait itself failed
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => match Signal::try_from(signal) {
                Ok(signal) => write!(f, "signal {}", signal.as_str()),
                Err(_) => write!(f, "signal {}", signal),
            },
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Lifecycle of a managed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, readiness not yet observed
    Starting,
    /// Readiness observed, start still in progress
    Ready,
    /// Handed to the caller
    Running,
    /// A terminating signal has been delivered
    Stopping,
    /// The process is gone
    Exited,
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

struct Inner {
    name: String,
    pid: Pid,
    started_at: Instant,
    state: Mutex<ProcessState>,
    ready: Arc<watch::Sender<bool>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    output: OutputTail,
}

/// A live OS process started from a [`ComponentSpec`].
///
/// Cheap to clone; all clones observe the same process. Exit is broadcast, so
/// any number of observers may call [`ProcessHandle::wait`]. The process is
/// placed in its own process group and signals go to the whole group, which
/// also reaches children of wrapper scripts.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<Inner>,
}

impl ProcessHandle {
    /// Spawns the process described by `spec` and blocks until it is ready.
    ///
    /// If readiness is not observed within `spec.startup_timeout` the process
    /// is killed and `Error::StartupTimeout` is returned. An exit before
    /// readiness is reported as `Error::Startup`.
    pub async fn start(spec: ComponentSpec) -> Result<ProcessHandle> {
        info!(component = %spec.name, "starting {} {:?}", spec.command.display(), spec.args);

        let mut command = Command::new(&spec.command);
        command.args(&spec.args);
        spec.environment.apply_to(&mut command);
        if let Some(ref dir) = spec.working_directory {
            command.current_dir(dir);
        }

        // Own process group so a signal reaches the component and anything it forked
        command.process_group(0);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        // The harness runtime may have signals blocked; children must start with an empty mask
        unsafe {
            command.pre_exec(|| {
                use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
                pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|e| Error::Startup {
            component: spec.name.clone(),
            reason: format!("spawn {}: {}", spec.command.display(), e),
            output_tail: Vec::new(),
        })?;

        let pid = match child.id().map(i32::try_from) {
            Some(Ok(pid)) => Pid::from_raw(pid),
            _ => {
                return Err(Error::Startup {
                    component: spec.name.clone(),
                    reason: "process id unavailable after spawn".to_string(),
                    output_tail: Vec::new(),
                })
            }
        };
        debug!(component = %spec.name, "spawned with pid {}", pid);

        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let (exit_tx, exit_rx) = watch::channel(None);
        let output: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));

        let pattern = match spec.readiness {
            Readiness::Output(ref pattern) => Some(pattern.clone()),
            _ => None,
        };
        let mut scanners = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            scanners.push(tokio::spawn(scan_output(
                spec.name.clone(),
                stdout,
                pattern.clone(),
                Arc::clone(&ready_tx),
                Arc::clone(&output),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            scanners.push(tokio::spawn(scan_output(
                spec.name.clone(),
                stderr,
                pattern,
                Arc::clone(&ready_tx),
                Arc::clone(&output),
            )));
        }

        match spec.readiness {
            Readiness::Http(ref url) => {
                tokio::spawn(probe_http(
                    url.clone(),
                    Arc::clone(&ready_tx),
                    exit_rx.clone(),
                ));
            }
            Readiness::Tcp(addr) => {
                tokio::spawn(probe_tcp(addr, Arc::clone(&ready_tx), exit_rx.clone()));
            }
            Readiness::Immediate => {
                ready_tx.send_replace(true);
            }
            Readiness::Output(_) => {}
        }

        tokio::spawn(reap(spec.name.clone(), child, scanners, exit_tx));

        let handle = ProcessHandle {
            inner: Arc::new(Inner {
                name: spec.name.clone(),
                pid,
                started_at: Instant::now(),
                state: Mutex::new(ProcessState::Starting),
                ready: ready_tx,
                exit: exit_rx,
                output,
            }),
        };

        handle.await_ready(ready_rx, spec.startup_timeout).await?;
        handle.set_state(ProcessState::Running);
        info!(component = %spec.name, pid = %pid, "ready after {:?}", handle.uptime());
        Ok(handle)
    }

    async fn await_ready(
        &self,
        mut ready_rx: watch::Receiver<bool>,
        startup_timeout: Duration,
    ) -> Result<()> {
        let mut exit_rx = self.inner.exit.clone();

        tokio::select! {
            biased;

            // The sender lives in `Inner`, so this only resolves on readiness
            Ok(_) = ready_rx.wait_for(|ready| *ready) => {
                self.set_state(ProcessState::Ready);
                Ok(())
            }
            exited = exit_rx.wait_for(Option::is_some) => {
                let status = exited
                    .ok()
                    .and_then(|exit| *exit)
                    .unwrap_or_else(ProcessExit::unknown);
                Err(Error::Startup {
                    component: self.inner.name.clone(),
                    reason: format!("exited before becoming ready ({})", status),
                    output_tail: self.output_tail(),
                })
            }
            _ = sleep(startup_timeout) => {
                warn!(component = %self.inner.name, "not ready after {:?}, killing", startup_timeout);
                if let Err(e) = self.signal(SignalKind::Kill) {
                    warn!(component = %self.inner.name, "kill after startup timeout failed: {}", e);
                }
                let _ = self.wait_timeout(KILL_WAIT).await;
                Err(Error::StartupTimeout {
                    component: self.inner.name.clone(),
                    timeout: startup_timeout,
                    output_tail: self.output_tail(),
                })
            }
        }
    }

    /// Delivers `kind` to the process group.
    ///
    /// Signalling a process that has already exited is a no-op.
    pub fn signal(&self, kind: SignalKind) -> Result<()> {
        if self.has_exited() {
            debug!(component = %self.inner.name, "{} not sent, process already exited", kind);
            return Ok(());
        }

        debug!(component = %self.inner.name, "sending {} to process group {}", kind, self.inner.pid);
        match kill(Pid::from_raw(-self.inner.pid.as_raw()), kind.as_nix()) {
            Ok(()) => {
                self.set_state(ProcessState::Stopping);
                Ok(())
            }
            Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(Error::SignalDelivery {
                component: self.inner.name.clone(),
                signal: kind.name(),
                source,
            }),
        }
    }

    /// Waits for the process to exit. Safe to call from many observers.
    pub async fn wait(&self) -> Result<ProcessExit> {
        let mut exit_rx = self.inner.exit.clone();
        let exit = exit_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|exit| *exit);
        exit.ok_or_else(|| Error::Startup {
            component: self.inner.name.clone(),
            reason: "exit observer stopped without reporting a status".to_string(),
            output_tail: self.output_tail(),
        })
    }

    /// Waits for exit for at most `duration`; `None` means still running.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<Option<ProcessExit>> {
        match timeout(duration, self.wait()).await {
            Ok(exit) => exit.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Interrupts the process and escalates to SIGKILL after `grace`.
    pub async fn stop(&self, grace: Duration) -> Result<ProcessExit> {
        if let Err(e) = self.signal(SignalKind::Interrupt) {
            warn!(component = %self.inner.name, "interrupt failed: {}", e);
        }
        if let Some(exit) = self.wait_timeout(grace).await? {
            return Ok(exit);
        }

        warn!(component = %self.inner.name, "still running {:?} after interrupt, killing", grace);
        self.signal(SignalKind::Kill)?;
        self.wait_timeout(KILL_WAIT)
            .await?
            .ok_or_else(|| Error::Unresponsive {
                component: self.inner.name.clone(),
                waited: KILL_WAIT,
            })
    }

    /// Exit status, once the process has exited.
    pub fn try_exit(&self) -> Option<ProcessExit> {
        *self.inner.exit.borrow()
    }

    /// Exit code, once the process has exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        self.try_exit().and_then(|exit| exit.code)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn state(&self) -> ProcessState {
        if self.has_exited() {
            return ProcessState::Exited;
        }
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started_at.elapsed()
    }

    /// Most recent output lines, oldest first.
    pub fn output_tail(&self) -> Vec<String> {
        self.inner
            .output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn set_state(&self, state: ProcessState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.inner.name)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone while the process still runs: never leak it
        if self.exit.borrow().is_none() {
            eprintln!(
                "ProcessHandle for '{}' dropped with running process (PID: {}), killing process group",
                self.name, self.pid
            );
            match kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => eprintln!("Failed to kill process group {}: {}", self.pid, e),
            }
        }
    }
}

/// One decoded unit of component output.
#[derive(Debug, PartialEq, Eq)]
enum OutputLine {
    Line(String),
    /// A line longer than `MAX_LINE_LENGTH`, dropped up to its newline
    Overlong,
}

/// `LinesCodec` that yields over-long lines as `OutputLine::Overlong` instead
/// of failing, so the lines after them are still decoded.
#[derive(Debug)]
struct OutputCodec(LinesCodec);

impl OutputCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
    }

    fn skip_overlong(
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<OutputLine>, LinesCodecError> {
        match decoded {
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(OutputLine::Overlong)),
            other => other.map(|line| line.map(OutputLine::Line)),
        }
    }
}

impl Decoder for OutputCodec {
    type Item = OutputLine;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Self::skip_overlong(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Self::skip_overlong(self.0.decode_eof(buf))
    }
}

/// Forwards one output stream to the log, retains a tail and watches for the
/// readiness pattern. Keeps draining after readiness so the child never
/// blocks on a full pipe.
async fn scan_output<R: AsyncRead + Unpin>(
    component: String,
    stream: R,
    pattern: Option<String>,
    ready: Arc<watch::Sender<bool>>,
    output: OutputTail,
) {
    let mut lines = FramedRead::new(stream, OutputCodec::new());

    while let Some(line) = lines.next().await {
        match line {
            Ok(OutputLine::Line(line)) => {
                debug!(component = %component, "{}", line);
                if let Some(ref pattern) = pattern {
                    let already_ready = *ready.borrow();
                    if !already_ready && line.contains(pattern.as_str()) {
                        debug!(component = %component, "readiness pattern '{}' observed", pattern);
                        ready.send_replace(true);
                    }
                }
                let mut tail = output.lock().unwrap_or_else(PoisonError::into_inner);
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(OutputLine::Overlong) => {
                warn!(component = %component, "skipped output line longer than {} bytes", MAX_LINE_LENGTH);
            }
            Err(e) => {
                warn!(component = %component, "output stream failed: {}", e);
                break;
            }
        }
    }

    let mut rest = lines.into_inner();
    let _ = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await;
}

async fn probe_http(
    url: String,
    ready: Arc<watch::Sender<bool>>,
    exit: watch::Receiver<Option<ProcessExit>>,
) {
    let client = match reqwest::Client::builder()
        .timeout(READINESS_PROBE_INTERVAL * 10)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("cannot build readiness client for {}: {}", url, e);
            return;
        }
    };

    while still_probing(&ready, &exit) {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                ready.send_replace(true);
            }
            Ok(response) => debug!("readiness probe {} returned {}", url, response.status()),
            Err(e) => debug!("readiness probe {} failed: {}", url, e),
        }
        sleep(READINESS_PROBE_INTERVAL).await;
    }
}

async fn probe_tcp(
    addr: SocketAddr,
    ready: Arc<watch::Sender<bool>>,
    exit: watch::Receiver<Option<ProcessExit>>,
) {
    while still_probing(&ready, &exit) {
        if TcpStream::connect(addr).await.is_ok() {
            ready.send_replace(true);
        }
        sleep(READINESS_PROBE_INTERVAL).await;
    }
}

fn still_probing(ready: &watch::Sender<bool>, exit: &watch::Receiver<Option<ProcessExit>>) -> bool {
    let exited = exit.borrow().is_some();
    let ready = *ready.borrow();
    !exited && !ready
}

/// Owns the child and publishes its exit to every observer.
/// Waits for exit, lets the output scanners catch up, then publishes the status.
async fn reap(
    component: String,
    mut child: Child,
    scanners: Vec<JoinHandle<()>>,
    exit: watch::Sender<Option<ProcessExit>>,
) {
    let status = match child.wait().await {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            error!(component = %component, "error waiting for process: {}", e);
            ProcessExit::unknown()
        }
    };

    // Forked descendants may hold the pipes open; don't wait for them
    if timeout(OUTPUT_DRAIN_WAIT, join_all(scanners)).await.is_err() {
        debug!(component = %component, "output still open {:?} after exit", OUTPUT_DRAIN_WAIT);
    }
    info!(component = %component, "exited with {}", status);
    exit.send_replace(Some(status));
}
