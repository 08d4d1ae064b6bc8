//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Task;

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at).
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    repository_id: Uuid,
    name: &str,
    harness_name: &str,
    concurrency_limit: Option<i32>,
    retry_max_attempts: i32,
    retry_backoff_base_seconds: i32,
    retry_backoff_multiplier: f64,
    sandbox_profile: &Value,
    artifact_policy: &Value,
    approval_profile: Option<&Value>,
    cron_expression: Option<&str>,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (repository_id, name, harness_name, concurrency_limit, \
                             retry_max_attempts, retry_backoff_base_seconds, \
                             retry_backoff_multiplier, sandbox_profile, artifact_policy, \
                             approval_profile, cron_expression) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(repository_id)
    .bind(name)
    .bind(harness_name)
    .bind(concurrency_limit)
    .bind(retry_max_attempts)
    .bind(retry_backoff_base_seconds)
    .bind(retry_backoff_multiplier)
    .bind(sandbox_profile)
    .bind(artifact_policy)
    .bind(approval_profile)
    .bind(cron_expression)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks for a given repository, ordered by creation time.
pub async fn list_tasks_for_repository(pool: &PgPool, repository_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE repository_id = $1 ORDER BY created_at ASC",
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for repository")?;

    Ok(tasks)
}

/// List every enabled task that carries a cron expression, for a scheduler
/// tick that drives cron-triggered runs.
pub async fn list_enabled_cron_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE enabled AND cron_expression IS NOT NULL ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list enabled cron tasks")?;

    Ok(tasks)
}

/// Enable or disable a task.
pub async fn set_task_enabled(pool: &PgPool, id: Uuid, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET enabled = $1 WHERE id = $2")
        .bind(enabled)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update task enabled flag")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}
