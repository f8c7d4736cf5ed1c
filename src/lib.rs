//! Process orchestration and scenario verification for multi-node cluster
//! tests.
//!
//! The harness drives externally built components as black boxes: it starts
//! them as supervised process groups, polls the cluster's observable state
//! with eventually/consistently assertions, and can swap a dependency binary
//! for a fault-injecting shim.

pub mod api;
pub mod component;
pub mod config;
pub mod environment;
pub mod error;
pub mod fault;
pub mod group;
pub mod polling;
pub mod port_allocator;
pub mod process;
pub mod scenario;
pub mod workload;

pub use error::{Error, Result};
pub use fault::{FaultInjection, FaultInjector, FaultMatcher, FaultSpec, Trigger};
pub use group::{stop_processes, GroupOptions, GroupState, ProcessGroup, StartOrder, Supervised};
pub use polling::{Polling, ProbeError, ProbeResult};
pub use port_allocator::PortAllocator;
pub use process::{ComponentSpec, ProcessExit, ProcessHandle, ProcessState, Readiness, SignalKind};
