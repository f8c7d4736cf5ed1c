pub mod fake_cluster;
pub mod shell_cluster;

pub use fake_cluster::{FakeBehavior, FakeCluster};
pub use shell_cluster::{write_executable, ShellCluster};
