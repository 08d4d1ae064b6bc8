//! `DeadRunDetector`: periodic scan for stale, zombie, and over-age runs,
//! plus orphan-runtime termination.
//!
//! Grounded on `gator-db/src/queries/tasks.rs`'s `reset_orphaned_tasks` (the
//! restart-recovery sweep is the same shape: find stuck rows, force them to
//! a terminal state) generalized from crash-restart recovery to
//! time-threshold-driven liveness checks.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::models::RunState;
use fleetd_db::queries::runs as db;

use crate::clock::Clock;
use crate::config::DeadRunDetectionConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::events::{EventBus, NewRunEvent};
use crate::gateway::RuntimeGateway;
use crate::pool::RuntimePool;

/// Outcome of a single detector pass, for logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub queue_timeouts: Vec<Uuid>,
    pub stops_issued: Vec<Uuid>,
    pub zombies_terminated: Vec<Uuid>,
    pub orphans_terminated: Vec<Uuid>,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        self.queue_timeouts.is_empty()
            && self.stops_issued.is_empty()
            && self.zombies_terminated.is_empty()
            && self.orphans_terminated.is_empty()
    }
}

pub struct DeadRunDetector {
    pool: PgPool,
    gateway: Arc<dyn RuntimeGateway>,
    runtime_pool: Arc<RuntimePool>,
    event_bus: Arc<EventBus>,
    config: DeadRunDetectionConfig,
    clock: Arc<dyn Clock>,
}

impl DeadRunDetector {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn RuntimeGateway>,
        runtime_pool: Arc<RuntimePool>,
        event_bus: Arc<EventBus>,
        config: DeadRunDetectionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            gateway,
            runtime_pool,
            event_bus,
            config,
            clock,
        }
    }

    /// Run one detector pass: queue-timeout, stale/zombie liveness, and
    /// orphan-runtime termination. Safe to call on an interval from a
    /// periodic loop (default every `checkIntervalSeconds`).
    pub async fn run_once(&self) -> CoreResult<SweepReport> {
        let mut report = SweepReport::default();

        report.queue_timeouts = self.sweep_queue_timeouts().await?;
        let (stopped, zombied) = self.sweep_liveness().await?;
        report.stops_issued = stopped;
        report.zombies_terminated = zombied;
        report.orphans_terminated = self.sweep_orphans().await?;

        if !report.is_empty() {
            tracing::info!(
                queue_timeouts = report.queue_timeouts.len(),
                stops_issued = report.stops_issued.len(),
                zombies = report.zombies_terminated.len(),
                orphans = report.orphans_terminated.len(),
                "dead-run detector sweep completed"
            );
        }

        Ok(report)
    }

    async fn sweep_queue_timeouts(&self) -> CoreResult<Vec<Uuid>> {
        let threshold = self.clock.now() - ChronoDuration::hours(self.config.max_run_age_hours as i64);
        let stale_queued = db::list_stale_queued(&self.pool, threshold)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list stale queued runs", e))?;

        let mut terminated = Vec::new();
        for run in stale_queued {
            let rows = db::complete_run(
                &self.pool,
                run.id,
                RunState::Queued,
                RunState::Failed,
                None,
                Some("run exceeded maxRunAgeHours while queued"),
                Some("queue_timeout"),
            )
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fail stale queued run", e))?;
            if rows > 0 {
                self.emit_failed(&run, "queue_timeout", "run exceeded maxRunAgeHours while queued")
                    .await;
                terminated.push(run.id);
            }
        }
        Ok(terminated)
    }

    async fn sweep_liveness(&self) -> CoreResult<(Vec<Uuid>, Vec<Uuid>)> {
        let zombie_threshold =
            self.clock.now() - ChronoDuration::minutes(self.config.zombie_run_threshold_minutes as i64);
        let stale_threshold =
            self.clock.now() - ChronoDuration::minutes(self.config.stale_run_threshold_minutes as i64);

        let stale_running = db::list_stale_running(&self.pool, stale_threshold)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list stale running runs", e))?;

        let mut stopped = Vec::new();
        let mut zombied = Vec::new();

        for run in stale_running {
            let is_zombie = run
                .last_heartbeat_at
                .map(|hb| hb < zombie_threshold)
                .unwrap_or(true);

            if !is_zombie {
                if let Some(runtime_id) = run.dispatched_to_runtime_id {
                    if let Err(e) = self.gateway.stop_job(runtime_id, run.id).await {
                        tracing::warn!(run_id = %run.id, error = %e, "failed to issue stop for stale run");
                    }
                }
                stopped.push(run.id);
                continue;
            }

            // Zombie: past the harder threshold. Escalate to force-kill
            // when configured.
            if self.config.force_kill_on_timeout {
                if let Some(runtime_id) = run.dispatched_to_runtime_id {
                    let runtime = self.runtime_pool.get(runtime_id).await.ok();
                    if let Some(container_id) = runtime.and_then(|r| r.container_id) {
                        if let Err(e) = self.gateway.kill_container(runtime_id, &container_id).await {
                            tracing::warn!(run_id = %run.id, error = %e, "failed to force-kill zombie run's container");
                        }
                    }
                    let _ = self.runtime_pool.release_lease(runtime_id).await;
                }
            }

            if self.config.enable_auto_termination {
                let rows = db::complete_run(
                    &self.pool,
                    run.id,
                    RunState::Running,
                    RunState::Failed,
                    None,
                    Some("run stopped heartbeating past zombieRunThresholdMinutes"),
                    Some("zombie"),
                )
                .await
                .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fail zombie run", e))?;
                if rows > 0 {
                    self.emit_failed(&run, "zombie", "run stopped heartbeating past zombieRunThresholdMinutes")
                        .await;
                    zombied.push(run.id);
                }
            }
        }

        Ok((stopped, zombied))
    }

    async fn sweep_orphans(&self) -> CoreResult<Vec<Uuid>> {
        let orphaned = db::reset_orphaned_runs(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to reset orphaned runs", e))?;

        let mut ids = Vec::with_capacity(orphaned.len());
        for run in &orphaned {
            self.emit_failed(run, "orphaned", "dispatched runtime no longer present in the pool")
                .await;
            ids.push(run.id);
        }
        Ok(ids)
    }

    async fn emit_failed(&self, run: &fleetd_db::models::Run, error_code: &str, message: &str) {
        let new_event = NewRunEvent {
            run_id: run.id,
            task_id: run.task_id,
            execution_token: run.execution_token,
            category: fleetd_db::models::EventCategory::RunCompleted,
            schema_version: crate::events::DEFAULT_SCHEMA_VERSION,
            payload_json: Some(json!({
                "status": "failed",
                "errorCode": error_code,
                "message": message,
            })),
            content_type: Some("application/json".to_string()),
            command_id: None,
            artifact_id: None,
            chunk_index: None,
            is_last_chunk: None,
        };
        if let Err(e) = self.event_bus.publish(new_event).await {
            tracing::warn!(run_id = %run.id, error = %e, "failed to publish run.completed for terminated run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_report_empty_by_default() {
        assert!(SweepReport::default().is_empty());
    }
}
