use crate::error::{Error, Result};
use crate::process::{ComponentSpec, ProcessHandle, SignalKind, KILL_WAIT};
use futures::future::{join_all, BoxFuture};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Grace period between interrupt and kill when none is configured
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Anything the harness can stop: a single process or a whole group.
pub trait Supervised: Send + Sync {
    fn name(&self) -> &str;

    /// Delivers `kind`; delivering to something already gone is a no-op.
    fn signal(&self, kind: SignalKind) -> BoxFuture<'_, Result<()>>;

    /// Resolves once everything has exited; errors on a non-zero exit.
    fn wait(&self) -> BoxFuture<'_, Result<()>>;

    fn has_exited(&self) -> bool;
}

impl Supervised for ProcessHandle {
    fn name(&self) -> &str {
        ProcessHandle::name(self)
    }

    fn signal(&self, kind: SignalKind) -> BoxFuture<'_, Result<()>> {
        let delivered = ProcessHandle::signal(self, kind);
        async move { delivered }.boxed()
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            let exit = ProcessHandle::wait(self).await?;
            if exit.success() {
                Ok(())
            } else {
                Err(Error::NonZeroExit {
                    component: self.name().to_string(),
                    status: exit.to_string(),
                })
            }
        }
        .boxed()
    }

    fn has_exited(&self) -> bool {
        ProcessHandle::has_exited(self)
    }
}

/// How group members are brought up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOrder {
    /// Member i+1 starts only once member i is ready
    #[default]
    Ordered,
    /// All members start at once
    Parallel,
}

/// Lifecycle of a process group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Forming,
    Up,
    TearingDown,
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct GroupOptions {
    pub order: StartOrder,
    /// Wait between interrupt and kill during teardown
    pub grace: Duration,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            order: StartOrder::Ordered,
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// A set of processes started and stopped as a unit.
///
/// Startup is all-or-nothing: if any member fails, every member that did
/// start is stopped before the error is returned. Teardown is idempotent and
/// always signals every member, whatever state earlier members are in.
#[derive(Debug)]
pub struct ProcessGroup {
    name: String,
    members: Vec<ProcessHandle>,
    state: Mutex<GroupState>,
    grace: Duration,
}

impl ProcessGroup {
    /// Starts `specs` as one group.
    ///
    /// # Arguments
    /// * `name` - Group name for logs
    /// * `specs` - Members in declared order
    /// * `options` - Start order and teardown grace period
    ///
    /// # Returns
    /// * `Result<Self>` - The running group, or the first startup error
    pub async fn invoke(
        name: impl Into<String>,
        specs: Vec<ComponentSpec>,
        options: GroupOptions,
    ) -> Result<Self> {
        let name = name.into();
        info!(group = %name, "starting {} member(s) ({:?})", specs.len(), options.order);

        let started = match options.order {
            StartOrder::Ordered => start_ordered(&name, specs, options.grace).await?,
            StartOrder::Parallel => start_parallel(&name, specs, options.grace).await?,
        };

        info!(group = %name, "all members ready");
        Ok(Self {
            name,
            members: started,
            state: Mutex::new(GroupState::Up),
            grace: options.grace,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[ProcessHandle] {
        &self.members
    }

    pub fn member(&self, name: &str) -> Option<&ProcessHandle> {
        self.members.iter().find(|m| m.name() == name)
    }

    pub fn state(&self) -> GroupState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Broadcasts `kind` to every member concurrently.
    ///
    /// A delivery failure on one member does not stop delivery to the rest;
    /// the first failure is returned after all attempts.
    pub async fn signal(&self, kind: SignalKind) -> Result<()> {
        let outcomes = join_all(self.members.iter().map(|member| async move {
            let outcome = member.signal(kind);
            if let Err(ref e) = outcome {
                error!(group = %self.name, "{}", e);
            }
            outcome
        }))
        .await;
        outcomes.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    /// Waits for every member to exit.
    ///
    /// Returns the first non-zero exit, in order of exit, as the error.
    pub async fn wait(&self) -> Result<()> {
        let mut exits: FuturesUnordered<_> = self
            .members
            .iter()
            .map(|member| Supervised::wait(member))
            .collect();

        let mut first_failure = None;
        while let Some(outcome) = exits.next().await {
            if let Err(e) = outcome {
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Like [`ProcessGroup::wait`] but bounded; `Ok(false)` means members are
    /// still running at the deadline.
    pub async fn wait_timeout(&self, duration: Duration) -> Result<bool> {
        match timeout(duration, self.wait()).await {
            Ok(outcome) => outcome.map(|_| true),
            Err(_) => Ok(false),
        }
    }

    /// Stops every member: interrupt, wait up to the grace period, then kill.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == GroupState::Down {
                return Ok(());
            }
            *state = GroupState::TearingDown;
        }

        info!(group = %self.name, "tearing down {} member(s)", self.members.len());
        let outcome = terminate(&self.members, self.grace).await;

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = GroupState::Down;
        outcome
    }
}

impl Supervised for ProcessGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn signal(&self, kind: SignalKind) -> BoxFuture<'_, Result<()>> {
        ProcessGroup::signal(self, kind).boxed()
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        ProcessGroup::wait(self).boxed()
    }

    fn has_exited(&self) -> bool {
        self.members.iter().all(ProcessHandle::has_exited)
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.state() == GroupState::Down {
            return;
        }
        for member in self.members.iter().filter(|m| !m.has_exited()) {
            eprintln!(
                "ProcessGroup '{}' dropped without shutdown, killing '{}' (PID: {})",
                self.name,
                member.name(),
                member.pid()
            );
            if let Err(e) = member.signal(SignalKind::Kill) {
                eprintln!("Failed to kill '{}': {}", member.name(), e);
            }
        }
    }
}

/// Stops any mix of processes and groups concurrently.
///
/// Each is interrupted, given `grace` to exit, then killed. Exit statuses are
/// not judged; only a process that survives SIGKILL is an error.
pub async fn stop_processes(processes: &[&dyn Supervised], grace: Duration) -> Result<()> {
    let outcomes = join_all(processes.iter().map(|process| stop_one(*process, grace))).await;
    outcomes.into_iter().find(Result::is_err).unwrap_or(Ok(()))
}

async fn stop_one(process: &dyn Supervised, grace: Duration) -> Result<()> {
    if process.has_exited() {
        return Ok(());
    }
    if let Err(e) = process.signal(SignalKind::Interrupt).await {
        warn!("interrupting '{}' failed: {}", process.name(), e);
    }
    if timeout(grace, process.wait()).await.is_ok() {
        return Ok(());
    }

    warn!("'{}' still running {:?} after interrupt, killing", process.name(), grace);
    if let Err(e) = process.signal(SignalKind::Kill).await {
        warn!("killing '{}' failed: {}", process.name(), e);
    }
    match timeout(KILL_WAIT, process.wait()).await {
        Ok(_) => Ok(()),
        Err(_) => Err(Error::Unresponsive {
            component: process.name().to_string(),
            waited: KILL_WAIT,
        }),
    }
}

async fn terminate(members: &[ProcessHandle], grace: Duration) -> Result<()> {
    let members: Vec<&dyn Supervised> = members.iter().map(|m| m as &dyn Supervised).collect();
    stop_processes(&members, grace).await
}

async fn start_ordered(
    group: &str,
    specs: Vec<ComponentSpec>,
    grace: Duration,
) -> Result<Vec<ProcessHandle>> {
    let mut started: Vec<ProcessHandle> = Vec::with_capacity(specs.len());

    for spec in specs {
        let member = spec.name.clone();
        match ProcessHandle::start(spec).await {
            Ok(handle) => started.push(handle),
            Err(e) => {
                error!(group = %group, "member '{}' failed to start: {}", member, e);
                abandon(group, &started, grace).await;
                return Err(e);
            }
        }
    }
    Ok(started)
}

async fn start_parallel(
    group: &str,
    specs: Vec<ComponentSpec>,
    grace: Duration,
) -> Result<Vec<ProcessHandle>> {
    let outcomes = join_all(specs.into_iter().map(ProcessHandle::start)).await;

    let mut started = Vec::with_capacity(outcomes.len());
    let mut first_error = None;
    for outcome in outcomes {
        match outcome {
            Ok(handle) => started.push(handle),
            Err(e) => {
                error!(group = %group, "{}", e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        None => Ok(started),
        Some(e) => {
            abandon(group, &started, grace).await;
            Err(e)
        }
    }
}

/// Stops members of a group that failed to form.
async fn abandon(group: &str, started: &[ProcessHandle], grace: Duration) {
    if started.is_empty() {
        return;
    }
    warn!(group = %group, "stopping {} already-started member(s)", started.len());
    if let Err(e) = terminate(started, grace).await {
        error!(group = %group, "cleanup after failed start: {}", e);
    }
}
