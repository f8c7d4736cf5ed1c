//! Integration tests for cellharness
//!
//! Components are `/bin/sh` stand-ins; the desired-state API, router and agent
//! admin endpoints are served by an in-process fake cluster.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{FakeBehavior, FakeCluster, ShellCluster};
