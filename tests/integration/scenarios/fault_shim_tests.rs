use crate::integration::infrastructure::write_executable;
use anyhow::Result;
use cellharness::{FaultInjector, FaultMatcher, FaultSpec};
use std::path::Path;
use std::process::Output;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::Command;

/// Plugin stand-in with distinctive streams and exit code
const TARGET_SCRIPT: &str = "#!/bin/sh\necho \"out:$*\"\necho \"err:$#\" >&2\nexit 7\n";

const SHIM_RUNNER: &str = env!("CARGO_BIN_EXE_cellharness");

fn target(dir: &TempDir) -> Result<std::path::PathBuf> {
    let path = dir.path().join("grootfs");
    write_executable(&path, TARGET_SCRIPT)?;
    Ok(path)
}

fn delete_fault(delay: Duration) -> FaultSpec {
    FaultSpec::one_shot(FaultMatcher::verb("delete").at(2).excluding("healthcheck"), delay)
}

async fn invoke(shim: &Path, args: &[&str]) -> Result<(Output, Duration)> {
    let started = Instant::now();
    let output = tokio::time::timeout(Duration::from_secs(30), Command::new(shim).args(args).output()).await??;
    Ok((output, started.elapsed()))
}

/// Streams and exit code are the target's, byte for byte
#[tokio::test]
async fn test_shim_preserves_streams_and_exit_code() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new()?;
    let injection = FaultInjector::new(SHIM_RUNNER).wrap(&target(&dir)?, delete_fault(Duration::from_millis(200)))?;

    let (output, _) = invoke(injection.shim_path(), &["--store", "/var/store", "stats", "app-1"]).await?;

    assert_eq!(output.status.code(), Some(7));
    assert_eq!(String::from_utf8(output.stdout)?, "out:--store /var/store stats app-1\n");
    assert_eq!(String::from_utf8(output.stderr)?, "err:4\n");
    assert_eq!(injection.triggered(), 0);

    let trace = injection.trace_lines()?;
    assert_eq!(trace.len(), 1);
    assert!(trace[0].ends_with("--store /var/store stats app-1"), "{}", trace[0]);
    Ok(())
}

/// Racing matching invocations: exactly one is delayed
#[tokio::test]
async fn test_one_shot_delay_under_concurrent_invocations() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new()?;
    let delay = Duration::from_millis(1500);
    let injection = FaultInjector::new(SHIM_RUNNER).wrap(&target(&dir)?, delete_fault(delay))?;
    let shim = injection.shim_path().to_path_buf();

    let runs = futures::future::join_all(
        (0..6).map(|i| {
            let shim = shim.clone();
            async move {
                let container = format!("app-{}", i);
                invoke(&shim, &["--store", "/var/store", "delete", &container]).await
            }
        }),
    )
    .await;

    let mut delayed = 0;
    for run in runs {
        let (output, elapsed) = run?;
        assert_eq!(output.status.code(), Some(7));
        if elapsed >= delay - Duration::from_millis(100) {
            delayed += 1;
        }
    }
    assert_eq!(delayed, 1);
    assert_eq!(injection.triggered(), 1);
    assert_eq!(injection.invocations(), 6);

    let trace = injection.trace_lines()?;
    assert_eq!(trace.len(), 6);
    assert_eq!(trace.iter().filter(|line| line.contains("[delayed 1500ms]")).count(), 1);
    Ok(())
}

/// Health-check containers never trigger the fault
#[tokio::test]
async fn test_healthcheck_delete_passes_through() -> Result<()> {
    let dir = TempDir::new()?;
    let delay = Duration::from_secs(5);
    let injection = FaultInjector::new(SHIM_RUNNER).wrap(&target(&dir)?, delete_fault(delay))?;

    let (output, elapsed) = invoke(
        injection.shim_path(),
        &["--store", "/var/store", "delete", "executor-healthcheck-1"],
    )
    .await?;

    assert_eq!(output.status.code(), Some(7));
    assert!(elapsed < delay);
    assert_eq!(injection.triggered(), 0);

    // The real delete still gets its delay afterwards
    let (_, elapsed) = invoke(injection.shim_path(), &["--store", "/var/store", "delete", "app"]).await?;
    assert!(elapsed >= delay - Duration::from_millis(100));
    Ok(())
}

/// Without a controller the shim delegates at once and notes why
#[tokio::test]
async fn test_shim_without_controller_delegates() -> Result<()> {
    let dir = TempDir::new()?;
    let target = target(&dir)?;
    let trace = dir.path().join("trace");

    let started = Instant::now();
    let output = Command::new(SHIM_RUNNER)
        .arg("fault-shim")
        .arg("--control")
        .arg(dir.path().join("missing.sock"))
        .arg("--target")
        .arg(&target)
        .arg("--trace")
        .arg(&trace)
        .args(["--", "--store", "/s", "delete", "app"])
        .output()
        .await?;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(output.status.code(), Some(7));
    assert_eq!(String::from_utf8(output.stdout)?, "out:--store /s delete app\n");
    let trace = std::fs::read_to_string(trace)?;
    assert!(trace.contains("controller unavailable"), "{}", trace);
    Ok(())
}

#[tokio::test]
async fn test_shim_reports_missing_target() -> Result<()> {
    let dir = TempDir::new()?;
    let output = Command::new(SHIM_RUNNER)
        .arg("fault-shim")
        .arg("--control")
        .arg(dir.path().join("missing.sock"))
        .arg("--target")
        .arg(dir.path().join("no-such-plugin"))
        .arg("--trace")
        .arg(dir.path().join("trace"))
        .args(["--", "delete"])
        .output()
        .await?;

    assert_eq!(output.status.code(), Some(127));
    assert!(String::from_utf8_lossy(&output.stderr).contains("exec failed"));
    Ok(())
}
