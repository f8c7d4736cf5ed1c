use crate::integration::infrastructure::{FakeBehavior, FakeCluster};
use anyhow::Result;
use cellharness::scenario::await_task_completion;
use cellharness::workload::CompletedWorkload;
use cellharness::{Error, Polling};
use std::time::Duration;
use tempfile::TempDir;

fn completed(task_guid: &str, failed: bool) -> CompletedWorkload {
    CompletedWorkload {
        task_guid: task_guid.to_string(),
        failed,
        failure_reason: if failed { "exit status 1".to_string() } else { String::new() },
        result: if failed { String::new() } else { "hello world".to_string() },
    }
}

/// The check keeps polling until the task lands among the completed ones
#[tokio::test]
async fn test_task_completion_observed() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = TempDir::new()?;
    let fake = FakeCluster::new(dir.path(), FakeBehavior::default());
    fake.complete_task(completed("other-task", false));

    let finisher = fake.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        finisher.complete_task(completed("task-1", false));
    });

    let task = await_task_completion(&fake.desired(), &Polling::from_millis(5000, 50)?, "task-1").await?;
    assert_eq!(task, completed("task-1", false));
    Ok(())
}

/// A failed task is still a completion; its failure is reported, not retried
#[tokio::test]
async fn test_failed_task_is_returned() -> Result<()> {
    let dir = TempDir::new()?;
    let fake = FakeCluster::new(dir.path(), FakeBehavior::default());
    fake.complete_task(completed("task-2", true));

    let task = await_task_completion(&fake.desired(), &Polling::from_millis(1000, 50)?, "task-2").await?;
    assert!(task.failed);
    assert_eq!(task.failure_reason, "exit status 1");
    Ok(())
}

#[tokio::test]
async fn test_task_never_completing_times_out() -> Result<()> {
    let dir = TempDir::new()?;
    let fake = FakeCluster::new(dir.path(), FakeBehavior::default());
    fake.complete_task(completed("other-task", false));

    let err = await_task_completion(&fake.desired(), &Polling::from_millis(300, 50)?, "task-3")
        .await
        .unwrap_err();
    match err {
        Error::AssertionTimeout {
            description,
            last_observed,
            ..
        } => {
            assert!(description.contains("task-3"));
            assert!(last_observed.contains("1 completed task(s)"), "{}", last_observed);
        }
        other => panic!("expected an assertion timeout, got {:?}", other),
    }
    Ok(())
}
