use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the harness.
///
/// Every variant is fatal to the scenario that produced it. Teardown of the
/// processes a scenario started is still attempted after any of them.
#[derive(Debug, Error)]
pub enum Error {
    /// A component could not be spawned or exited before it became ready.
    #[error("component '{component}' failed to start: {reason}{}", format_tail(.output_tail))]
    Startup {
        component: String,
        reason: String,
        output_tail: Vec<String>,
    },

    /// A component did not report readiness before its startup timeout.
    #[error("component '{component}' not ready after {timeout:?}{}", format_tail(.output_tail))]
    StartupTimeout {
        component: String,
        timeout: Duration,
        output_tail: Vec<String>,
    },

    /// An eventually-assertion never observed a satisfying value.
    #[error("timed out after {elapsed:?} waiting for {description}; last observed: {last_observed}")]
    AssertionTimeout {
        description: String,
        elapsed: Duration,
        last_observed: String,
    },

    /// A consistently-assertion (or a fatal probe) observed a violating value.
    #[error("{description} violated after {elapsed:?}: observed {observed}")]
    ConsistencyViolation {
        description: String,
        elapsed: Duration,
        observed: String,
    },

    /// Deadline/interval pair rejected before any polling began.
    #[error("invalid polling configuration: deadline {deadline:?}, interval {interval:?}")]
    InvalidPolling { deadline: Duration, interval: Duration },

    #[error("port range exhausted: requested {requested}, {remaining} remaining")]
    PortExhaustion { requested: u16, remaining: u32 },

    #[error("fault injection setup failed for {}: {reason}", .target.display())]
    FaultInjectionSetup { target: PathBuf, reason: String },

    /// Signal delivery failed for a reason other than the process being gone.
    #[error("failed to deliver {signal} to '{component}': {source}")]
    SignalDelivery {
        component: String,
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    /// A process exited with a non-zero status where success was required.
    #[error("component '{component}' exited with {status}")]
    NonZeroExit { component: String, status: String },

    /// A process survived SIGKILL for longer than the harness is willing to wait.
    #[error("component '{component}' still running {waited:?} after SIGKILL")]
    Unresponsive { component: String, waited: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scenario failed: {0}")]
    Scenario(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_tail(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!("\n--- last output ---\n{}", tail.join("\n"))
    }
}
