//! Database query functions for the `queued_background_work` table:
//! dedupe-by-`operation_key`, progress tracking, and LRU-bounded terminal
//! retention.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{BackgroundWorkKind, BackgroundWorkState, QueuedBackgroundWork};

/// Find an active (Pending or Running) entry for `operation_key`, if any.
/// Used to implement `Enqueue`'s dedupe-by-key contract before inserting.
pub async fn find_active_by_operation_key(
    pool: &PgPool,
    operation_key: &str,
) -> Result<Option<QueuedBackgroundWork>> {
    let work = sqlx::query_as::<_, QueuedBackgroundWork>(
        "SELECT * FROM queued_background_work \
         WHERE operation_key = $1 AND state IN ('pending', 'running') \
         LIMIT 1",
    )
    .bind(operation_key)
    .fetch_optional(pool)
    .await
    .context("failed to look up active background work by operation key")?;

    Ok(work)
}

/// Insert a new Pending background work entry.
pub async fn insert_work(
    pool: &PgPool,
    operation_key: &str,
    kind: BackgroundWorkKind,
    is_critical: bool,
) -> Result<QueuedBackgroundWork> {
    let work = sqlx::query_as::<_, QueuedBackgroundWork>(
        "INSERT INTO queued_background_work (operation_key, kind, state, is_critical) \
         VALUES ($1, $2, 'pending', $3) \
         RETURNING *",
    )
    .bind(operation_key)
    .bind(kind)
    .bind(is_critical)
    .fetch_one(pool)
    .await
    .context("failed to insert background work")?;

    Ok(work)
}

/// Fetch a single background work entry by ID.
pub async fn get_work(pool: &PgPool, id: Uuid) -> Result<Option<QueuedBackgroundWork>> {
    let work =
        sqlx::query_as::<_, QueuedBackgroundWork>("SELECT * FROM queued_background_work WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch background work")?;

    Ok(work)
}

/// Snapshot of every background work entry, newest first.
pub async fn list_snapshots(pool: &PgPool) -> Result<Vec<QueuedBackgroundWork>> {
    let work = sqlx::query_as::<_, QueuedBackgroundWork>(
        "SELECT * FROM queued_background_work ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list background work snapshots")?;

    Ok(work)
}

/// Transition Pending → Running, stamping `started_at`.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queued_background_work \
         SET state = 'running', started_at = now(), updated_at = now() \
         WHERE id = $1 AND state = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark background work running")?;

    Ok(result.rows_affected())
}

/// Coalesce a progress update: percent (clamped 0-100 by the caller) and
/// an optional status message.
pub async fn update_progress(
    pool: &PgPool,
    id: Uuid,
    percent: i32,
    message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queued_background_work \
         SET percent = $1, message = COALESCE($2, message), updated_at = now() \
         WHERE id = $3 AND state = 'running'",
    )
    .bind(percent)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update background work progress")?;

    Ok(result.rows_affected())
}

/// Transition a background work entry to a terminal state.
pub async fn complete_work(
    pool: &PgPool,
    id: Uuid,
    to: BackgroundWorkState,
    error_code: Option<&str>,
    message: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE queued_background_work \
         SET state = $1, error_code = $2, message = COALESCE($3, message), updated_at = now() \
         WHERE id = $4 AND state IN ('pending', 'running')",
    )
    .bind(to)
    .bind(error_code)
    .bind(message)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete background work")?;

    Ok(result.rows_affected())
}

/// Delete the oldest terminal entries beyond `max_retained`, keeping the
/// most recently updated ones (LRU by `updated_at`).
pub async fn prune_terminal_beyond(pool: &PgPool, max_retained: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM queued_background_work \
         WHERE state IN ('succeeded', 'failed', 'cancelled') \
           AND id NOT IN ( \
               SELECT id FROM queued_background_work \
               WHERE state IN ('succeeded', 'failed', 'cancelled') \
               ORDER BY updated_at DESC \
               LIMIT $1 \
           )",
    )
    .bind(max_retained)
    .execute(pool)
    .await
    .context("failed to prune terminal background work entries")?;

    Ok(result.rows_affected())
}
