//! Database query functions for the `task_runtimes` table: lease
//! acquisition/scoring support, heartbeat ingestion, and lifecycle
//! transitions.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskRuntime, TaskRuntimeState};

/// Insert a newly provisioning runtime.
pub async fn insert_task_runtime(pool: &PgPool, max_slots: i32) -> Result<TaskRuntime> {
    let runtime = sqlx::query_as::<_, TaskRuntime>(
        "INSERT INTO task_runtimes (max_slots, lifecycle_state) \
         VALUES ($1, 'provisioning') \
         RETURNING *",
    )
    .bind(max_slots)
    .fetch_one(pool)
    .await
    .context("failed to insert task runtime")?;

    Ok(runtime)
}

/// Fetch a single runtime by ID.
pub async fn get_task_runtime(pool: &PgPool, id: Uuid) -> Result<Option<TaskRuntime>> {
    let runtime = sqlx::query_as::<_, TaskRuntime>("SELECT * FROM task_runtimes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task runtime")?;

    Ok(runtime)
}

/// List every runtime, newest first.
pub async fn list_task_runtimes(pool: &PgPool) -> Result<Vec<TaskRuntime>> {
    let runtimes =
        sqlx::query_as::<_, TaskRuntime>("SELECT * FROM task_runtimes ORDER BY created_at DESC")
            .fetch_all(pool)
            .await
            .context("failed to list task runtimes")?;

    Ok(runtimes)
}

/// Candidate runtimes for a lease: lifecycle state Ready or Busy, with a
/// free slot. The pool applies the affinity/age scoring function in
/// memory over this candidate set.
pub async fn list_lease_candidates(pool: &PgPool) -> Result<Vec<TaskRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskRuntime>(
        "SELECT * FROM task_runtimes \
         WHERE lifecycle_state IN ('ready', 'busy') AND active_slots < max_slots",
    )
    .fetch_all(pool)
    .await
    .context("failed to list lease candidate runtimes")?;

    Ok(runtimes)
}

/// Atomically acquire one slot on a runtime, transitioning Ready→Busy
/// (or staying Busy). Uses optimistic locking on `active_slots` to avoid
/// a racing acquirer overshooting `max_slots`.
pub async fn acquire_lease(pool: &PgPool, runtime_id: Uuid, expected_active_slots: i32) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes \
         SET active_slots = active_slots + 1, \
             lifecycle_state = 'busy' \
         WHERE id = $1 \
           AND active_slots = $2 \
           AND active_slots < max_slots \
           AND lifecycle_state IN ('ready', 'busy')",
    )
    .bind(runtime_id)
    .bind(expected_active_slots)
    .execute(pool)
    .await
    .context("failed to acquire runtime lease")?;

    Ok(result.rows_affected())
}

/// Release one slot on a runtime, transitioning back to Ready when no
/// slots remain occupied.
pub async fn release_lease(pool: &PgPool, runtime_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes \
         SET active_slots = GREATEST(active_slots - 1, 0), \
             lifecycle_state = CASE WHEN active_slots - 1 <= 0 THEN 'ready' ELSE lifecycle_state END \
         WHERE id = $1 AND lifecycle_state IN ('ready', 'busy')",
    )
    .bind(runtime_id)
    .execute(pool)
    .await
    .context("failed to release runtime lease")?;

    Ok(result.rows_affected())
}

/// Record a heartbeat payload: active/max slots, CPU/memory percentages.
/// Resets `missed_heartbeats` to zero.
pub async fn record_heartbeat(
    pool: &PgPool,
    runtime_id: Uuid,
    active_slots: i32,
    max_slots: i32,
    cpu_percent: Option<f64>,
    memory_percent: Option<f64>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes \
         SET active_slots = $1, max_slots = $2, cpu_percent = $3, memory_percent = $4, \
             last_heartbeat_at = now(), missed_heartbeats = 0 \
         WHERE id = $5",
    )
    .bind(active_slots)
    .bind(max_slots)
    .bind(cpu_percent)
    .bind(memory_percent)
    .bind(runtime_id)
    .execute(pool)
    .await
    .context("failed to record runtime heartbeat")?;

    Ok(result.rows_affected())
}

/// Runtimes whose last heartbeat predates the freshness window (or who
/// have never heartbeated since Starting). Used by the pool's
/// quarantine sweep.
pub async fn list_stale_heartbeats(
    pool: &PgPool,
    threshold: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<TaskRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskRuntime>(
        "SELECT * FROM task_runtimes \
         WHERE lifecycle_state IN ('ready', 'busy', 'starting') \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
    )
    .bind(threshold)
    .fetch_all(pool)
    .await
    .context("failed to list stale-heartbeat runtimes")?;

    Ok(runtimes)
}

/// Increment the missed-heartbeat counter for a runtime, returning the
/// new count.
pub async fn increment_missed_heartbeats(pool: &PgPool, runtime_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE task_runtimes SET missed_heartbeats = missed_heartbeats + 1 \
         WHERE id = $1 \
         RETURNING missed_heartbeats",
    )
    .bind(runtime_id)
    .fetch_one(pool)
    .await
    .context("failed to increment missed heartbeats")?;

    Ok(row.0)
}

/// Atomically transition a runtime's lifecycle state. Uses optimistic
/// locking on the expected `from` state.
pub async fn transition_lifecycle_state(
    pool: &PgPool,
    runtime_id: Uuid,
    from: TaskRuntimeState,
    to: TaskRuntimeState,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes SET lifecycle_state = $1 WHERE id = $2 AND lifecycle_state = $3",
    )
    .bind(to)
    .bind(runtime_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition runtime lifecycle state")?;

    Ok(result.rows_affected())
}

/// Clear a runtime's quarantine, returning it to Ready for leasing again.
pub async fn clear_quarantine(pool: &PgPool, runtime_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes SET lifecycle_state = 'ready', missed_heartbeats = 0 \
         WHERE id = $1 AND lifecycle_state = 'quarantined'",
    )
    .bind(runtime_id)
    .execute(pool)
    .await
    .context("failed to clear runtime quarantine")?;

    Ok(result.rows_affected())
}

/// Force a runtime straight to Draining regardless of current occupancy,
/// used by `RecycleRuntime`/`RecyclePool`.
pub async fn force_drain(pool: &PgPool, runtime_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_runtimes SET lifecycle_state = 'draining' \
         WHERE id = $1 AND lifecycle_state NOT IN ('stopped', 'stopping')",
    )
    .bind(runtime_id)
    .execute(pool)
    .await
    .context("failed to force runtime into draining")?;

    Ok(result.rows_affected())
}

/// Runtimes in Ready with zero active slots, for the idle scale-in sweep.
pub async fn list_idle_ready(pool: &PgPool) -> Result<Vec<TaskRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskRuntime>(
        "SELECT * FROM task_runtimes WHERE lifecycle_state = 'ready' AND active_slots = 0",
    )
    .fetch_all(pool)
    .await
    .context("failed to list idle runtimes")?;

    Ok(runtimes)
}

/// Count runtimes not yet in a terminal lifecycle state, for enforcing
/// `maxTaskRuntimes`.
pub async fn count_non_terminal(pool: &PgPool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_runtimes WHERE lifecycle_state NOT IN ('stopped', 'failed_start')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count non-terminal runtimes")?;

    Ok(row.0)
}
