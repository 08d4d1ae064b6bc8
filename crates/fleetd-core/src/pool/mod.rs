//! `RuntimePool`: lifecycle management of task-runtimes -- leasing,
//! heartbeat ingestion, pressure-based scale-out, idle scale-in, and orphan
//! reconciliation.
//!
//! Grounded on the optimistic-transition pattern in [`crate::state`] (itself
//! generalized from the teacher's `TaskStateMachine`) for the runtime
//! lifecycle states, and on Design Note §9's guidance to centralize mutable
//! pool bookkeeping (pressure samples, idle-since timestamps, scale-out
//! cooldown) in a single value owned by one task rather than scattering
//! locks across callers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::models::{TaskRuntime, TaskRuntimeState};
use fleetd_db::queries::runtimes as db;

use crate::clock::Clock;
use crate::config::RuntimePoolConfig;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::gateway::RuntimeGateway;

/// Consecutive missed heartbeats before a runtime is quarantined.
const MAX_MISSED_HEARTBEATS: i32 = 3;

/// A successful lease: the runtime the caller may dispatch to.
#[derive(Debug, Clone)]
pub struct Lease {
    pub runtime_id: Uuid,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
}

/// Outcome of an [`RuntimePool::acquire_lease`] attempt.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// A runtime accepted the lease.
    Acquired(Lease),
    /// No runtime is currently available; a new one may have been queued
    /// for provisioning. The caller should defer the run to the next tick.
    Deferred,
}

struct PressureWindow {
    samples: VecDeque<(DateTime<Utc>, f64, f64)>,
}

impl PressureWindow {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, at: DateTime<Utc>, cpu: f64, memory: f64, window: ChronoDuration) {
        self.samples.push_back((at, cpu, memory));
        while let Some((ts, _, _)) = self.samples.front() {
            if at - *ts > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn means(&self) -> Option<(f64, f64)> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let (cpu_sum, mem_sum) = self
            .samples
            .iter()
            .fold((0.0, 0.0), |(c, m), (_, cpu, mem)| (c + cpu, m + mem));
        Some((cpu_sum / n, mem_sum / n))
    }
}

/// In-memory bookkeeping the database schema has no room for: per-runtime
/// pressure samples, idle-since timestamps, and the scale-out cooldown
/// clock. Lost on process restart, which is acceptable -- these are
/// advisory signals, not correctness-critical state.
struct PoolState {
    pressure: HashMap<Uuid, PressureWindow>,
    idle_since: HashMap<Uuid, DateTime<Utc>>,
    last_scale_out_at: Option<DateTime<Utc>>,
}

impl PoolState {
    fn new() -> Self {
        Self {
            pressure: HashMap::new(),
            idle_since: HashMap::new(),
            last_scale_out_at: None,
        }
    }
}

/// Manages the set of task-runtimes: lease acquisition, heartbeat
/// ingestion, scaling, and recycling.
pub struct RuntimePool {
    pool: PgPool,
    gateway: Arc<dyn RuntimeGateway>,
    config: RuntimePoolConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState>,
}

impl RuntimePool {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn RuntimeGateway>,
        config: RuntimePoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            gateway,
            config,
            clock,
            state: Mutex::new(PoolState::new()),
        }
    }

    /// Acquire a lease for one slot, preferring a runtime already handling
    /// the same repository (affinity), then the least-loaded and oldest
    /// candidate. Score = (affinity ? +100 : 0) - activeSlots*10 -
    /// ageSeconds/60.
    pub async fn acquire_lease(
        &self,
        repository_id: Uuid,
        _task_id: Uuid,
    ) -> CoreResult<LeaseOutcome> {
        let candidates = db::list_lease_candidates(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list lease candidates", e))?;

        let now = self.clock.now();
        let mut scored: Vec<(f64, TaskRuntime)> = candidates
            .into_iter()
            .map(|rt| {
                let affinity = rt.assigned_repository_ids.contains(&repository_id);
                let age_seconds = (now - rt.created_at).num_seconds().max(0) as f64;
                let score = (if affinity { 100.0 } else { 0.0 })
                    - (rt.active_slots as f64 * 10.0)
                    - (age_seconds / 60.0);
                (score, rt)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        for (_, candidate) in scored {
            let rows = db::acquire_lease(&self.pool, candidate.id, candidate.active_slots)
                .await
                .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to acquire lease", e))?;
            if rows > 0 {
                self.state.lock().unwrap().idle_since.remove(&candidate.id);
                return Ok(LeaseOutcome::Acquired(Lease {
                    runtime_id: candidate.id,
                    container_id: candidate.container_id,
                    endpoint: candidate.endpoint,
                }));
            }
            // Lost the race on this candidate (another dispatcher acquired
            // it first); fall through and try the next-best candidate.
        }

        // No runtime available. Queue provisioning of a new one if under
        // the cap; either way the caller defers to the next tick.
        self.maybe_start_provisioning().await?;
        Ok(LeaseOutcome::Deferred)
    }

    /// Release a previously acquired lease, returning the runtime to Ready
    /// when no slots remain occupied.
    pub async fn release_lease(&self, runtime_id: Uuid) -> CoreResult<()> {
        db::release_lease(&self.pool, runtime_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to release lease", e))?;
        self.state
            .lock()
            .unwrap()
            .idle_since
            .insert(runtime_id, self.clock.now());
        Ok(())
    }

    /// Start provisioning a new runtime if the pool has room and isn't
    /// cooling down from a recent scale-out. Returns `true` if a new
    /// runtime was queued.
    async fn maybe_start_provisioning(&self) -> CoreResult<bool> {
        let non_terminal = db::count_non_terminal(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to count runtimes", e))?;
        if non_terminal as u32 >= self.config.max_task_runtimes {
            return Ok(false);
        }

        db::insert_task_runtime(&self.pool, self.config.parallel_slots_per_task_runtime as i32)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to provision runtime", e))?;
        self.state.lock().unwrap().last_scale_out_at = Some(self.clock.now());
        Ok(true)
    }

    /// Record a heartbeat payload from a runtime, resetting its missed
    /// count and feeding the pressure-sampling window.
    pub async fn record_heartbeat(
        &self,
        runtime_id: Uuid,
        active_slots: i32,
        max_slots: i32,
        cpu_percent: Option<f64>,
        memory_percent: Option<f64>,
    ) -> CoreResult<()> {
        let rows = db::record_heartbeat(
            &self.pool,
            runtime_id,
            active_slots,
            max_slots,
            cpu_percent,
            memory_percent,
        )
        .await
        .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to record heartbeat", e))?;

        if rows == 0 {
            return Err(CoreError::not_found(format!("runtime {runtime_id} not found")));
        }

        if let (Some(cpu), Some(mem)) = (cpu_percent, memory_percent) {
            let window = ChronoDuration::seconds(self.config.pressure_sample_window_seconds as i64);
            let now = self.clock.now();
            self.state
                .lock()
                .unwrap()
                .pressure
                .entry(runtime_id)
                .or_insert_with(PressureWindow::new)
                .push(now, cpu, mem, window);
        }

        if active_slots == 0 {
            self.state
                .lock()
                .unwrap()
                .idle_since
                .entry(runtime_id)
                .or_insert(self.clock.now());
        } else {
            self.state.lock().unwrap().idle_since.remove(&runtime_id);
        }

        Ok(())
    }

    /// Scan for runtimes whose heartbeat has gone stale. Each miss
    /// increments the runtime's counter; at [`MAX_MISSED_HEARTBEATS`] the
    /// runtime is quarantined (evicted from leasing until an operator
    /// clears it).
    pub async fn quarantine_stale_heartbeats(&self, heartbeat_interval: chrono::Duration) -> CoreResult<Vec<Uuid>> {
        let freshness_window = heartbeat_interval * 3;
        let threshold = self.clock.now() - freshness_window;

        let stale = db::list_stale_heartbeats(&self.pool, threshold)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list stale runtimes", e))?;

        let mut quarantined = Vec::new();
        for runtime in stale {
            let missed = db::increment_missed_heartbeats(&self.pool, runtime.id)
                .await
                .map_err(|e| {
                    CoreError::with_source(ErrorKind::InternalError, "failed to bump missed heartbeats", e)
                })?;
            if missed >= MAX_MISSED_HEARTBEATS {
                let _ = db::transition_lifecycle_state(
                    &self.pool,
                    runtime.id,
                    runtime.lifecycle_state,
                    TaskRuntimeState::Quarantined,
                )
                .await;
                quarantined.push(runtime.id);
                tracing::warn!(runtime_id = %runtime.id, missed, "runtime quarantined after missed heartbeats");
            }
        }

        Ok(quarantined)
    }

    /// Evaluate pressure-based scale-out: if CPU or memory means exceed
    /// their thresholds over the sample window and there is queued demand,
    /// start one additional runtime subject to the global cap and a
    /// cooldown equal to the sample window.
    pub async fn evaluate_pressure_scale_out(&self, queued_run_count: i64) -> CoreResult<bool> {
        if !self.config.enable_pressure_scaling || queued_run_count == 0 {
            return Ok(false);
        }

        let cooldown = ChronoDuration::seconds(self.config.pressure_sample_window_seconds as i64);
        {
            let state = self.state.lock().unwrap();
            if let Some(last) = state.last_scale_out_at {
                if self.clock.now() - last < cooldown {
                    return Ok(false);
                }
            }
        }

        let over_threshold = {
            let state = self.state.lock().unwrap();
            state.pressure.values().any(|w| match w.means() {
                Some((cpu, mem)) => {
                    cpu >= self.config.cpu_scale_out_threshold_percent as f64
                        || mem >= self.config.memory_scale_out_threshold_percent as f64
                }
                None => false,
            })
        };

        if !over_threshold {
            return Ok(false);
        }

        self.maybe_start_provisioning().await
    }

    /// Drain runtimes that have been idle (Ready, zero leases) for at
    /// least `idleTimeoutMinutes`, as long as at least one runtime remains
    /// non-terminal afterward.
    pub async fn scale_in_idle(&self) -> CoreResult<Vec<Uuid>> {
        let idle_ready = db::list_idle_ready(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list idle runtimes", e))?;

        let timeout = ChronoDuration::minutes(self.config.idle_timeout_minutes as i64);
        let now = self.clock.now();
        let non_terminal = db::count_non_terminal(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to count runtimes", e))?;

        let mut drained = Vec::new();
        let mut remaining = non_terminal;
        for runtime in idle_ready {
            if remaining <= 1 {
                break;
            }
            let idle_since = {
                let mut state = self.state.lock().unwrap();
                *state.idle_since.entry(runtime.id).or_insert(now)
            };
            if now - idle_since >= timeout {
                let rows = db::force_drain(&self.pool, runtime.id)
                    .await
                    .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to drain runtime", e))?;
                if rows > 0 {
                    drained.push(runtime.id);
                    remaining -= 1;
                }
            }
        }

        Ok(drained)
    }

    /// Ask each non-stopped runtime to reconcile containers not tied to a
    /// live run. Failures are logged and skipped -- a transient gateway
    /// error on one runtime should not block reconciliation of the rest.
    pub async fn reconcile_orphans(&self) -> CoreResult<()> {
        let runtimes = db::list_task_runtimes(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list runtimes", e))?;

        for runtime in runtimes {
            if matches!(runtime.lifecycle_state, TaskRuntimeState::Stopped) {
                continue;
            }
            match self.gateway.reconcile_orphaned_containers(runtime.id).await {
                Ok(result) if result.reconciled_count > 0 => {
                    tracing::info!(
                        runtime_id = %runtime.id,
                        reconciled = result.reconciled_count,
                        "reconciled orphaned containers"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(runtime_id = %runtime.id, error = %e, "orphan reconciliation failed");
                }
            }
        }

        Ok(())
    }

    /// Force a single runtime to Draining regardless of current occupancy.
    pub async fn recycle_runtime(&self, runtime_id: Uuid) -> CoreResult<()> {
        let rows = db::force_drain(&self.pool, runtime_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to recycle runtime", e))?;
        if rows == 0 {
            return Err(CoreError::not_found(format!(
                "runtime {runtime_id} not found or already stopped"
            )));
        }
        Ok(())
    }

    /// Recycle every non-Stopped runtime in rolling order, leaving at
    /// least one in service when the pool has more than one runtime.
    pub async fn recycle_pool(&self) -> CoreResult<Vec<Uuid>> {
        let runtimes = db::list_task_runtimes(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list runtimes", e))?;

        let eligible: Vec<Uuid> = runtimes
            .iter()
            .filter(|rt| !matches!(rt.lifecycle_state, TaskRuntimeState::Stopped))
            .map(|rt| rt.id)
            .collect();

        let keep_one = eligible.len() > 1;
        let mut recycled = Vec::new();
        for (i, id) in eligible.into_iter().enumerate() {
            if keep_one && i == 0 {
                // Leave the first candidate in service so a request
                // arriving mid-recycle still has somewhere to land.
                continue;
            }
            if db::force_drain(&self.pool, id).await.unwrap_or(0) > 0 {
                recycled.push(id);
            }
        }

        Ok(recycled)
    }

    /// Clear a runtime's quarantine, returning it to Ready. No-op (returns
    /// `NotFound`) if the runtime isn't currently quarantined.
    pub async fn clear_quarantine(&self, runtime_id: Uuid) -> CoreResult<()> {
        let rows = db::clear_quarantine(&self.pool, runtime_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to clear quarantine", e))?;
        if rows == 0 {
            return Err(CoreError::not_found(format!(
                "runtime {runtime_id} not found or not quarantined"
            )));
        }
        Ok(())
    }

    pub async fn get(&self, runtime_id: Uuid) -> CoreResult<TaskRuntime> {
        db::get_task_runtime(&self.pool, runtime_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch runtime", e))?
            .ok_or_else(|| CoreError::not_found(format!("runtime {runtime_id} not found")))
    }

    pub async fn list(&self) -> CoreResult<Vec<TaskRuntime>> {
        db::list_task_runtimes(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list runtimes", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_window_drops_old_samples() {
        let mut window = PressureWindow::new();
        let t0 = Utc::now();
        window.push(t0, 10.0, 20.0, ChronoDuration::seconds(60));
        window.push(t0 + ChronoDuration::seconds(30), 20.0, 30.0, ChronoDuration::seconds(60));
        window.push(t0 + ChronoDuration::seconds(120), 90.0, 90.0, ChronoDuration::seconds(60));

        // The first two samples should have fallen out of a 60s window by
        // the time the third is pushed at t0+120s.
        let (cpu, mem) = window.means().unwrap();
        assert_eq!(cpu, 90.0);
        assert_eq!(mem, 90.0);
    }

    #[test]
    fn pressure_window_means_none_when_empty() {
        let window = PressureWindow::new();
        assert!(window.means().is_none());
    }
}
