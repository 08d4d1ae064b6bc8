//! `fleetd background` -- inspect the background work queue's current
//! snapshot. The coordinator itself only runs work enqueued in-process by
//! `serve`; this is a read-only view over its retained history.

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::core_ctx::CoreHandles;

pub async fn list(core: &CoreHandles) -> Result<()> {
    let items = core.background.snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

pub async fn get(core: &CoreHandles, work_id: Uuid) -> Result<()> {
    let item = core
        .background
        .try_get(work_id)
        .await?
        .with_context(|| format!("background work {work_id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&item)?);
    Ok(())
}
