//! `fleetd run` -- create, retry, cancel, and inspect runs via the
//! scheduler. Dispatch itself only happens once a `serve` process is ticking
//! the scheduler; these commands just enqueue/mutate rows and read them back.

use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use fleetd_core::scheduler::RunFilter;

use crate::core_ctx::CoreHandles;

pub async fn create(core: &CoreHandles, task_id: Uuid, concurrency_key: Option<&str>) -> Result<()> {
    let run_id = core.scheduler.create_run(task_id, concurrency_key).await?;
    println!("{run_id}");
    Ok(())
}

pub async fn retry(core: &CoreHandles, run_id: Uuid) -> Result<()> {
    let new_run_id = core.scheduler.retry_run(run_id).await?;
    println!("{new_run_id}");
    Ok(())
}

pub async fn cancel(core: &CoreHandles, run_id: Uuid, grace_seconds: u64) -> Result<()> {
    core.scheduler
        .cancel_run(run_id, Duration::from_secs(grace_seconds))
        .await?;
    Ok(())
}

pub async fn get(core: &CoreHandles, run_id: Uuid) -> Result<()> {
    let run = core.scheduler.get_run(run_id).await?;
    println!("{}", serde_json::to_string_pretty(&run)?);
    Ok(())
}

pub async fn list(core: &CoreHandles, task_id: Option<Uuid>, repository_id: Option<Uuid>) -> Result<()> {
    let runs = core
        .scheduler
        .list_runs(RunFilter {
            task_id,
            repository_id,
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}
