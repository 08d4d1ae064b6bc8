//! Database query functions for the `run_events` table: the EventBus's
//! durable backlog.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EventCategory, RunEvent};

/// Parameters for publishing a new event. `delivery_id` and `sequence`
/// are server-assigned: `delivery_id` from a process-wide `BIGSERIAL`,
/// `sequence` from the per-run maximum plus one, computed atomically in
/// the same INSERT.
#[derive(Debug, Clone)]
pub struct NewRunEvent {
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub execution_token: Option<Uuid>,
    pub category: EventCategory,
    pub schema_version: i32,
    pub payload_json: Option<Value>,
    pub content_type: Option<String>,
    pub command_id: Option<String>,
    pub artifact_id: Option<String>,
    pub chunk_index: Option<i32>,
    pub is_last_chunk: Option<bool>,
}

/// Publish a new event, assigning `sequence` atomically from the current
/// per-run maximum.
pub async fn insert_run_event(pool: &PgPool, new: &NewRunEvent) -> Result<RunEvent> {
    let event = sqlx::query_as::<_, RunEvent>(
        "INSERT INTO run_events \
             (run_id, task_id, execution_token, sequence, category, schema_version, \
              payload_json, content_type, command_id, artifact_id, chunk_index, is_last_chunk) \
         VALUES ( \
             $1, $2, $3, \
             COALESCE((SELECT MAX(sequence) FROM run_events WHERE run_id = $1), 0) + 1, \
             $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING *",
    )
    .bind(new.run_id)
    .bind(new.task_id)
    .bind(new.execution_token)
    .bind(new.category)
    .bind(new.schema_version)
    .bind(&new.payload_json)
    .bind(&new.content_type)
    .bind(&new.command_id)
    .bind(&new.artifact_id)
    .bind(new.chunk_index)
    .bind(new.is_last_chunk)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert run event for run {}", new.run_id))?;

    Ok(event)
}

/// Events for a single run, ordered by `sequence` ascending.
pub async fn list_events_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<RunEvent>> {
    let events = sqlx::query_as::<_, RunEvent>(
        "SELECT * FROM run_events WHERE run_id = $1 ORDER BY sequence ASC",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for run {run_id}"))?;

    Ok(events)
}

/// Read the event backlog after a given `delivery_id`, capped at
/// `max_events`. Returns events in `delivery_id` order.
pub async fn read_backlog(pool: &PgPool, after_delivery_id: i64, max_events: i64) -> Result<Vec<RunEvent>> {
    let events = sqlx::query_as::<_, RunEvent>(
        "SELECT * FROM run_events WHERE delivery_id > $1 ORDER BY delivery_id ASC LIMIT $2",
    )
    .bind(after_delivery_id)
    .bind(max_events)
    .fetch_all(pool)
    .await
    .context("failed to read event backlog")?;

    Ok(events)
}

/// The highest `delivery_id` currently persisted, or 0 if the table is
/// empty. Used to report `lastDeliveryId`/`hasMore` to backlog readers.
pub async fn max_delivery_id(pool: &PgPool) -> Result<i64> {
    let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(delivery_id) FROM run_events")
        .fetch_one(pool)
        .await
        .context("failed to fetch max delivery id")?;

    Ok(row.0.unwrap_or(0))
}

/// Delete events older than `retain_count` per run, keeping the most
/// recent `retain_count` by `sequence`. Used to enforce bounded backlog
/// retention.
pub async fn prune_old_events_for_run(pool: &PgPool, run_id: Uuid, retain_count: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM run_events \
         WHERE run_id = $1 \
           AND sequence <= ( \
               SELECT sequence FROM run_events \
               WHERE run_id = $1 \
               ORDER BY sequence DESC \
               OFFSET $2 LIMIT 1 \
           )",
    )
    .bind(run_id)
    .bind(retain_count)
    .execute(pool)
    .await
    .with_context(|| format!("failed to prune old events for run {run_id}"))?;

    Ok(result.rows_affected())
}
