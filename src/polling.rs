//! Eventually/consistently assertions over asynchronous external state.
//!
//! Both modes run on the caller's control flow: the scenario step that issues
//! an assertion does not advance until the assertion resolves. Every probe
//! attempt is itself bounded by the remaining budget, so a hung probe cannot
//! turn into a hung scenario.

use crate::error::{Error, Result};
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Why a single probe attempt produced no value.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// Transient; an eventually-assertion keeps polling
    #[error("{0}")]
    Retry(String),
    /// The assertion fails immediately, whatever its mode
    #[error("{0}")]
    Fatal(String),
}

impl ProbeError {
    pub fn fatal(message: impl Into<String>) -> Self {
        ProbeError::Fatal(message.into())
    }
}

impl From<Error> for ProbeError {
    fn from(error: Error) -> Self {
        ProbeError::Retry(error.to_string())
    }
}

pub type ProbeResult<T> = std::result::Result<T, ProbeError>;

/// A validated deadline/interval pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Polling {
    deadline: Duration,
    interval: Duration,
    /// Fixed per-attempt budget; otherwise the remaining deadline
    probe_budget: Option<Duration>,
}

/// How long the probe of an immediate check may take
const SINGLE_CHECK_PROBE_BUDGET: Duration = Duration::from_secs(5);

impl Polling {
    /// Rejects `interval == 0` and `deadline < interval` before any polling.
    pub fn new(deadline: Duration, interval: Duration) -> Result<Self> {
        if interval.is_zero() || deadline < interval {
            return Err(Error::InvalidPolling { deadline, interval });
        }
        Ok(Self {
            deadline,
            interval,
            probe_budget: None,
        })
    }

    pub fn from_millis(deadline_ms: u64, interval_ms: u64) -> Result<Self> {
        Self::new(
            Duration::from_millis(deadline_ms),
            Duration::from_millis(interval_ms),
        )
    }

    /// A single check with no waiting between attempts. The probe itself
    /// still gets a few seconds to answer.
    pub const fn immediate() -> Self {
        Self {
            deadline: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            probe_budget: Some(SINGLE_CHECK_PROBE_BUDGET),
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn attempt_budget(&self, started: Instant) -> Duration {
        self.probe_budget.unwrap_or_else(|| {
            self.deadline
                .saturating_sub(started.elapsed())
                .max(self.interval)
        })
    }

    /// Polls `probe` until `predicate` accepts a value or the deadline passes.
    ///
    /// The first attempt fires immediately. On timeout the error carries the
    /// last observed value (or probe error). A `ProbeError::Fatal` ends the
    /// wait at once with `Error::ConsistencyViolation`.
    pub async fn eventually<T, F, Fut, P>(
        &self,
        description: &str,
        mut probe: F,
        predicate: P,
    ) -> Result<T>
    where
        T: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult<T>>,
        P: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let mut last_observed = String::from("<no observation>");
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let budget = self.attempt_budget(started);

            match timeout(budget, probe()).await {
                Ok(Ok(value)) if predicate(&value) => {
                    debug!(
                        "{} satisfied after {} attempt(s) in {:?}",
                        description,
                        attempts,
                        started.elapsed()
                    );
                    return Ok(value);
                }
                Ok(Ok(value)) => last_observed = format!("{:?}", value),
                Ok(Err(ProbeError::Retry(message))) => last_observed = format!("error: {}", message),
                Ok(Err(ProbeError::Fatal(message))) => {
                    return Err(Error::ConsistencyViolation {
                        description: description.to_string(),
                        elapsed: started.elapsed(),
                        observed: message,
                    });
                }
                Err(_) => last_observed = format!("probe did not complete within {:?}", budget),
            }

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                warn!("{} not satisfied after {:?}: {}", description, elapsed, last_observed);
                return Err(Error::AssertionTimeout {
                    description: description.to_string(),
                    elapsed,
                    last_observed,
                });
            }
            sleep(self.interval.min(self.deadline - elapsed)).await;
        }
    }

    /// Samples `probe` every interval for the whole window (the deadline).
    ///
    /// Succeeds only if every sample satisfies `predicate`; the first failing
    /// sample, probe error or hung probe fails immediately with
    /// `Error::ConsistencyViolation`.
    pub async fn consistently<T, F, Fut, P>(
        &self,
        description: &str,
        mut probe: F,
        predicate: P,
    ) -> Result<()>
    where
        T: Debug,
        F: FnMut() -> Fut,
        Fut: Future<Output = ProbeResult<T>>,
        P: Fn(&T) -> bool,
    {
        let started = Instant::now();
        let mut samples = 0u32;

        loop {
            let budget = self.attempt_budget(started);
            let observed = match timeout(budget, probe()).await {
                Ok(Ok(value)) if predicate(&value) => None,
                Ok(Ok(value)) => Some(format!("{:?}", value)),
                Ok(Err(e)) => Some(format!("error: {}", e)),
                Err(_) => Some(format!("probe did not complete within {:?}", budget)),
            };

            if let Some(observed) = observed {
                let elapsed = started.elapsed();
                warn!("{} violated after {:?}: {}", description, elapsed, observed);
                return Err(Error::ConsistencyViolation {
                    description: description.to_string(),
                    elapsed,
                    observed,
                });
            }
            samples += 1;

            let elapsed = started.elapsed();
            if elapsed >= self.deadline {
                debug!("{} held for {:?} over {} sample(s)", description, elapsed, samples);
                return Ok(());
            }
            sleep(self.interval.min(self.deadline - elapsed)).await;
        }
    }
}
