use crate::api::DesiredState;
use crate::error::Result;
use crate::polling::{Polling, ProbeError, ProbeResult};
use crate::workload::CompletedWorkload;
use tracing::info;

/// Waits for a task to show up among the completed workloads.
///
/// # Arguments
/// * `desired` - Desired-state API to list completed workloads from
/// * `polling` - Deadline and interval of the wait
/// * `task_guid` - The task to wait for
///
/// # Returns
/// * `Ok(CompletedWorkload)` - The task's record; a failed task is returned
///   too, with `failed` set and its `failure_reason`
/// * `Err(Error::AssertionTimeout)` - The task never completed within the deadline
pub async fn await_task_completion<D: DesiredState>(
    desired: &D,
    polling: &Polling,
    task_guid: &str,
) -> Result<CompletedWorkload> {
    let description = format!("task {} completed", task_guid);
    let task = polling
        .eventually(&description, || find_completed(desired, task_guid), |_| true)
        .await?;
    info!(
        task_guid = %task.task_guid,
        failed = task.failed,
        failure_reason = %task.failure_reason,
        "task completed"
    );
    Ok(task)
}

async fn find_completed<D: DesiredState>(desired: &D, task_guid: &str) -> ProbeResult<CompletedWorkload> {
    let tasks = desired.completed_workloads().await?;
    let completed = tasks.len();
    tasks
        .into_iter()
        .find(|task| task.task_guid == task_guid)
        .ok_or_else(|| ProbeError::Retry(format!("not among {} completed task(s)", completed)))
}
