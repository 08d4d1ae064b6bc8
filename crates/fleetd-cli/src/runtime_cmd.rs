//! `fleetd runtime` -- inspect and administer task-runtimes in the pool.

use anyhow::Result;
use uuid::Uuid;

use crate::core_ctx::CoreHandles;

pub async fn list(core: &CoreHandles) -> Result<()> {
    let runtimes = core.runtime_pool.list().await?;
    println!("{}", serde_json::to_string_pretty(&runtimes)?);
    Ok(())
}

pub async fn get(core: &CoreHandles, runtime_id: Uuid) -> Result<()> {
    let runtime = core.runtime_pool.get(runtime_id).await?;
    println!("{}", serde_json::to_string_pretty(&runtime)?);
    Ok(())
}

pub async fn recycle(core: &CoreHandles, runtime_id: Uuid) -> Result<()> {
    core.runtime_pool.recycle_runtime(runtime_id).await?;
    Ok(())
}

pub async fn quarantine_clear(core: &CoreHandles, runtime_id: Uuid) -> Result<()> {
    core.runtime_pool.clear_quarantine(runtime_id).await?;
    Ok(())
}
