//! `fleetd task` -- minimal seed commands for the task row a run dispatches
//! against. Task authoring/editing UX lives outside the orchestration core;
//! this is just enough to exercise `fleetd run create`.

use anyhow::Result;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::queries::tasks;

#[allow(clippy::too_many_arguments)]
pub async fn create(
    pool: &PgPool,
    repository_id: Uuid,
    name: &str,
    harness_name: &str,
    concurrency_limit: Option<i32>,
    retry_max_attempts: i32,
    retry_backoff_base_seconds: i32,
    retry_backoff_multiplier: f64,
    cron_expression: Option<&str>,
) -> Result<()> {
    let task = tasks::insert_task(
        pool,
        repository_id,
        name,
        harness_name,
        concurrency_limit,
        retry_max_attempts,
        retry_backoff_base_seconds,
        retry_backoff_multiplier,
        &json!({}),
        &json!({}),
        None,
        cron_expression,
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

pub async fn list(pool: &PgPool, repository_id: Uuid) -> Result<()> {
    let tasks = tasks::list_tasks_for_repository(pool, repository_id).await?;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    Ok(())
}
