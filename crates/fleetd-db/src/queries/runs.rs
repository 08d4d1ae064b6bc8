//! Database query functions for the `runs` table: admission counting,
//! ranking for dispatch, optimistic-lock state transitions, and the
//! recovery sweep used by the dead-run detector.

use chrono::{DateTime, Utc};
use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Run, RunState};

/// Insert a new Queued run at `attempt`.
#[allow(clippy::too_many_arguments)]
pub async fn insert_run(
    pool: &PgPool,
    task_id: Uuid,
    repository_id: Uuid,
    attempt: i32,
    concurrency_key: Option<&str>,
    retry_policy: &Value,
    sandbox_profile: &Value,
    timeout_execution_seconds: i32,
    timeout_overall_seconds: i32,
) -> Result<Run> {
    let run = sqlx::query_as::<_, Run>(
        "INSERT INTO runs (task_id, repository_id, state, attempt, concurrency_key, \
                            retry_policy, sandbox_profile, timeout_execution_seconds, \
                            timeout_overall_seconds) \
         VALUES ($1, $2, 'queued', $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(repository_id)
    .bind(attempt)
    .bind(concurrency_key)
    .bind(retry_policy)
    .bind(sandbox_profile)
    .bind(timeout_execution_seconds)
    .bind(timeout_overall_seconds)
    .fetch_one(pool)
    .await
    .context("failed to insert run")?;

    Ok(run)
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// List runs for a task, newest first.
pub async fn list_runs_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE task_id = $1 ORDER BY created_at DESC")
        .bind(task_id)
        .fetch_all(pool)
        .await
        .context("failed to list runs for task")?;

    Ok(runs)
}

/// List runs for a repository, newest first.
pub async fn list_runs_for_repository(pool: &PgPool, repository_id: Uuid) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE repository_id = $1 ORDER BY created_at DESC",
    )
    .bind(repository_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs for repository")?;

    Ok(runs)
}

/// Queued runs in fairness order: ascending `created_at` then `id` as a
/// deterministic tiebreak. The per-repository round-robin pass is applied
/// in-memory by the scheduler over this ordered candidate list.
pub async fn list_queued_candidates(pool: &PgPool, limit: i64) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE state = 'queued' ORDER BY created_at ASC, id ASC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list queued run candidates")?;

    Ok(runs)
}

/// Count Running runs process-wide.
pub async fn count_running_global(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs WHERE state = 'running'")
        .fetch_one(pool)
        .await
        .context("failed to count running runs")?;

    Ok(row.0)
}

/// Count Running runs for a given repository.
pub async fn count_running_by_repository(pool: &PgPool, repository_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runs WHERE state = 'running' AND repository_id = $1",
    )
    .bind(repository_id)
    .fetch_one(pool)
    .await
    .context("failed to count running runs for repository")?;

    Ok(row.0)
}

/// Count Running runs for a given task.
pub async fn count_running_by_task(pool: &PgPool, task_id: Uuid) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM runs WHERE state = 'running' AND task_id = $1")
            .bind(task_id)
            .fetch_one(pool)
            .await
            .context("failed to count running runs for task")?;

    Ok(row.0)
}

/// Count Queued runs process-wide, for pressure-based scale-out demand.
pub async fn count_queued(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs WHERE state = 'queued'")
        .fetch_one(pool)
        .await
        .context("failed to count queued runs")?;

    Ok(row.0)
}

/// Count Running runs sharing a concurrency key.
pub async fn count_running_by_concurrency_key(pool: &PgPool, concurrency_key: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runs WHERE state = 'running' AND concurrency_key = $1",
    )
    .bind(concurrency_key)
    .fetch_one(pool)
    .await
    .context("failed to count running runs for concurrency key")?;

    Ok(row.0)
}

/// Atomically transition a run from `queued` to `running`, minting the
/// dispatch fields in the same statement. Uses optimistic locking: the
/// WHERE clause requires `state = 'queued'`, so a racing dispatcher never
/// double-admits the same run.
pub async fn dispatch_run(
    pool: &PgPool,
    run_id: Uuid,
    execution_token: Uuid,
    dispatched_to_runtime_id: Uuid,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET state = 'running', started_at = now(), execution_token = $1, \
             dispatched_to_runtime_id = $2, last_heartbeat_at = now() \
         WHERE id = $3 AND state = 'queued'",
    )
    .bind(execution_token)
    .bind(dispatched_to_runtime_id)
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to dispatch run")?;

    Ok(result.rows_affected())
}

/// Record a liveness heartbeat for a Running run.
pub async fn record_run_heartbeat(pool: &PgPool, run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET last_heartbeat_at = now() WHERE id = $1 AND state = 'running'",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to record run heartbeat")?;

    Ok(result.rows_affected())
}

/// Atomically transition a run into a terminal state, recording the
/// summary/error fields. `from` is the expected current state.
pub async fn complete_run(
    pool: &PgPool,
    run_id: Uuid,
    from: RunState,
    to: RunState,
    summary: Option<&str>,
    error: Option<&str>,
    error_code: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET state = $1, ended_at = now(), summary = $2, error = $3, error_code = $4 \
         WHERE id = $5 AND state = $6",
    )
    .bind(to)
    .bind(summary)
    .bind(error)
    .bind(error_code)
    .bind(run_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to complete run")?;

    Ok(result.rows_affected())
}

/// Cancel a run. Idempotent: cancelling an already-terminal run is a no-op
/// (affects zero rows, which callers should not treat as an error).
pub async fn cancel_run(pool: &PgPool, run_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs \
         SET state = 'cancelled', ended_at = now() \
         WHERE id = $1 AND state IN ('queued', 'running', 'pending_approval')",
    )
    .bind(run_id)
    .execute(pool)
    .await
    .context("failed to cancel run")?;

    Ok(result.rows_affected())
}

/// Insert a fresh Queued retry run sharing `task_id`/`repository_id` with
/// an incremented attempt counter. The caller is responsible for applying
/// the backoff delay before this row becomes eligible for dispatch.
pub async fn insert_retry_run(
    pool: &PgPool,
    previous: &Run,
) -> Result<Run> {
    insert_run(
        pool,
        previous.task_id,
        previous.repository_id,
        previous.attempt + 1,
        previous.concurrency_key.as_deref(),
        &previous.retry_policy,
        &previous.sandbox_profile,
        previous.timeout_execution_seconds,
        previous.timeout_overall_seconds,
    )
    .await
}

/// Runs in Running state whose heartbeat is older than `threshold`.
pub async fn list_stale_running(pool: &PgPool, threshold: DateTime<Utc>) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs \
         WHERE state = 'running' \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await
    .context("failed to list stale running runs")?;

    Ok(runs)
}

/// Queued runs older than `threshold`, eligible for the dead-run
/// detector's queue-timeout rule.
pub async fn list_stale_queued(pool: &PgPool, threshold: DateTime<Utc>) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE state = 'queued' AND created_at < $1",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await
    .context("failed to list stale queued runs")?;

    Ok(runs)
}

/// Force-terminate every Running run dispatched to a runtime that no
/// longer exists in the pool (orphan reconciliation / crash recovery).
/// Returns the runs that were reset.
pub async fn reset_orphaned_runs(pool: &PgPool) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "UPDATE runs \
         SET state = 'failed', ended_at = now(), error_code = 'orphaned', \
             error = 'dispatched runtime no longer present in the pool' \
         WHERE state = 'running' \
           AND dispatched_to_runtime_id IS NOT NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_runtimes tr WHERE tr.id = runs.dispatched_to_runtime_id \
           ) \
         RETURNING *",
    )
    .fetch_all(pool)
    .await
    .context("failed to reset orphaned runs")?;

    Ok(runs)
}
