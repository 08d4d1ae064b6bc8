//! The run scheduler: admission control, fairness ranking, dispatch,
//! retry/backoff, and cancellation.
//!
//! Grounded on `gator-core/src/orchestrator/mod.rs`'s tick-loop structure
//! (`run_orchestrator`'s completion channel and `CancellationToken`-driven
//! drain) and its retry path (`orchestrator_retry`), generalized from
//! DAG-task dispatch to admission-ranked run dispatch against a runtime
//! pool lease instead of a worktree/harness pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::models::{EventCategory, Run, RunState};
use fleetd_db::queries::repositories as repo_db;
use fleetd_db::queries::runs as db;
use fleetd_db::queries::tasks as task_db;

use crate::clock::{Clock, IdGen};
use crate::config::{RetryDefaults, SchedulerConfig};
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::events::EventBus;
use crate::gateway::{ArtifactPolicy, DispatchJobRequest, RuntimeGateway, SandboxProfile};
use crate::pool::{LeaseOutcome, RuntimePool};
use crate::state::RunStateMachine;

/// Default execution-stage and overall-run timeouts (spec §5), used when a
/// task doesn't override them.
pub const DEFAULT_EXECUTION_TIMEOUT_SECONDS: i32 = 600;
pub const DEFAULT_OVERALL_TIMEOUT_SECONDS: i32 = 1800;

/// How long `cancel_run` waits for a graceful `run.completed` before
/// escalating to a container kill (spec §4.1).
pub const DEFAULT_CANCEL_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

/// Filter applied to [`Scheduler::list_runs`]. Exactly one of `task_id`/
/// `repository_id` must be set.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<Uuid>,
    pub repository_id: Option<Uuid>,
}

/// Outcome of a single [`Scheduler::tick`] pass, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub dispatched: Vec<Uuid>,
    pub deferred: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Running per-tick admission counters, seeded from the database and
/// incremented in memory as candidates are admitted within the same tick
/// so a single pass never over-admits (spec §4.1 invariant).
struct AdmissionCounters {
    pool: PgPool,
    global_running: u32,
    per_repo: HashMap<Uuid, u32>,
    per_project: HashMap<String, u32>,
    per_task: HashMap<Uuid, u32>,
    per_concurrency_key: HashMap<String, u32>,
    project_key_of_repo: HashMap<Uuid, Option<String>>,
}

impl AdmissionCounters {
    async fn load(pool: &PgPool) -> CoreResult<Self> {
        let global_running = db::count_running_global(pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to count running runs", e))?
            as u32;
        Ok(Self {
            pool: pool.clone(),
            global_running,
            per_repo: HashMap::new(),
            per_project: HashMap::new(),
            per_task: HashMap::new(),
            per_concurrency_key: HashMap::new(),
            project_key_of_repo: HashMap::new(),
        })
    }

    async fn repo_count(&mut self, repository_id: Uuid) -> CoreResult<u32> {
        if let Some(count) = self.per_repo.get(&repository_id) {
            return Ok(*count);
        }
        let count = db::count_running_by_repository(&self.pool, repository_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to count running runs for repo", e))?
            as u32;
        self.per_repo.insert(repository_id, count);
        Ok(count)
    }

    async fn project_key(&mut self, repository_id: Uuid) -> CoreResult<Option<String>> {
        if let Some(key) = self.project_key_of_repo.get(&repository_id) {
            return Ok(key.clone());
        }
        let repo = repo_db::get_repository(&self.pool, repository_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch repository", e))?;
        let key = repo.and_then(|r| r.project_key);
        self.project_key_of_repo.insert(repository_id, key.clone());
        Ok(key)
    }

    async fn project_count(&mut self, project_key: &str) -> CoreResult<u32> {
        if let Some(count) = self.per_project.get(project_key) {
            return Ok(*count);
        }
        // No dedicated "count running by project" query exists in the
        // Store; derive it from the per-repository counters already
        // computed this tick, which is sufficient because every candidate
        // repository is touched via `repo_count` before this is called.
        let count = self.per_repo.values().sum();
        self.per_project.insert(project_key.to_string(), count);
        Ok(count)
    }

    async fn task_count(&mut self, task_id: Uuid) -> CoreResult<u32> {
        if let Some(count) = self.per_task.get(&task_id) {
            return Ok(*count);
        }
        let count = db::count_running_by_task(&self.pool, task_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to count running runs for task", e))?
            as u32;
        self.per_task.insert(task_id, count);
        Ok(count)
    }

    async fn concurrency_key_count(&mut self, key: &str) -> CoreResult<u32> {
        if let Some(count) = self.per_concurrency_key.get(key) {
            return Ok(*count);
        }
        let count = db::count_running_by_concurrency_key(&self.pool, key)
            .await
            .map_err(|e| {
                CoreError::with_source(ErrorKind::InternalError, "failed to count running runs for concurrency key", e)
            })? as u32;
        self.per_concurrency_key.insert(key.to_string(), count);
        Ok(count)
    }

    fn record_admission(&mut self, repository_id: Uuid, task_id: Uuid, concurrency_key: Option<&str>) {
        self.global_running += 1;
        *self.per_repo.entry(repository_id).or_insert(0) += 1;
        *self.per_task.entry(task_id).or_insert(0) += 1;
        if let Some(key) = concurrency_key {
            *self.per_concurrency_key.entry(key.to_string()).or_insert(0) += 1;
        }
    }
}

/// Group queued candidates by repository (preserving arrival order within
/// each group), then interleave round-robin so one run per repository is
/// tried before any repository gets a second -- the head-of-line-blocking
/// guard from spec §4.1.
fn rank_round_robin(candidates: Vec<Run>) -> Vec<Run> {
    let mut groups: Vec<(Uuid, Vec<Run>)> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    for run in candidates {
        let repo = run.repository_id;
        match index.get(&repo) {
            Some(&i) => groups[i].1.push(run),
            None => {
                index.insert(repo, groups.len());
                groups.push((repo, vec![run]));
            }
        }
    }

    let mut ranked = Vec::new();
    let mut round = 0;
    loop {
        let mut took_any = false;
        for (_, group) in groups.iter_mut() {
            if round < group.len() {
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
        for (_, group) in groups.iter_mut() {
            if round < group.len() {
                ranked.push(std::mem::replace(&mut group[round], dummy_run()));
            }
        }
        round += 1;
    }
    ranked
}

/// Placeholder swapped into a consumed slot by `mem::replace`; never read
/// because the round-robin loop only visits each `(group, round)` index
/// once.
fn dummy_run() -> Run {
    Run {
        id: Uuid::nil(),
        task_id: Uuid::nil(),
        repository_id: Uuid::nil(),
        state: RunState::Obsolete,
        attempt: 0,
        concurrency_key: None,
        execution_token: None,
        dispatched_to_runtime_id: None,
        retry_policy: serde_json::Value::Null,
        sandbox_profile: serde_json::Value::Null,
        timeout_execution_seconds: 0,
        timeout_overall_seconds: 0,
        last_heartbeat_at: None,
        summary: None,
        error: None,
        error_code: None,
        created_at: chrono::Utc::now(),
        started_at: None,
        ended_at: None,
    }
}

/// Heuristic classification of a dispatch failure into the spec §7
/// taxonomy, based on the gateway's error message. A structured error
/// channel from the (external) gateway implementation would replace this;
/// until then, unclassified failures default to `Transient` so they are at
/// least retried rather than silently stuck.
fn classify_dispatch_failure(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("rate limit") {
        ErrorKind::RateLimited
    } else if lower.contains("quota") || lower.contains("exhausted") || lower.contains("capacity") {
        ErrorKind::ResourceExhausted
    } else if lower.contains("permission") || lower.contains("denied") || lower.contains("unauthorized") {
        ErrorKind::PermissionDenied
    } else if lower.contains("config") {
        ErrorKind::ConfigurationError
    } else if lower.contains("invalid") {
        ErrorKind::InvalidInput
    } else {
        ErrorKind::Transient
    }
}

/// Exponential backoff for attempt `n` (1-indexed): `base * multiplier^(n-1)`.
fn backoff_for_attempt(defaults: &RetryDefaults, attempt: i32) -> std::time::Duration {
    let exponent = (attempt - 1).max(0) as i32;
    let seconds = defaults.backoff_base_seconds as f64 * defaults.backoff_multiplier.powi(exponent);
    std::time::Duration::from_secs_f64(seconds.max(0.0))
}

pub struct Scheduler {
    pool: PgPool,
    runtime_pool: Arc<RuntimePool>,
    gateway: Arc<dyn RuntimeGateway>,
    event_bus: Arc<EventBus>,
    config: SchedulerConfig,
    retry_defaults: RetryDefaults,
    clock: Arc<dyn Clock>,
    idgen: Arc<dyn IdGen>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        runtime_pool: Arc<RuntimePool>,
        gateway: Arc<dyn RuntimeGateway>,
        event_bus: Arc<EventBus>,
        config: SchedulerConfig,
        retry_defaults: RetryDefaults,
        clock: Arc<dyn Clock>,
        idgen: Arc<dyn IdGen>,
    ) -> Self {
        Self {
            pool,
            runtime_pool,
            gateway,
            event_bus,
            config,
            retry_defaults,
            clock,
            idgen,
        }
    }

    // -- Scheduler API (spec §6.1) ------------------------------------

    /// Enqueue a new Queued run for `task_id`, snapshotting the task's
    /// current retry policy and sandbox profile onto the run row.
    pub async fn create_run(&self, task_id: Uuid, concurrency_key: Option<&str>) -> CoreResult<Uuid> {
        let task = self.fetch_task(task_id).await?;
        let retry_policy = json!({
            "maxAttempts": task.retry_max_attempts,
            "backoffBaseSeconds": task.retry_backoff_base_seconds,
            "backoffMultiplier": task.retry_backoff_multiplier,
        });

        let run = db::insert_run(
            &self.pool,
            task_id,
            task.repository_id,
            1,
            concurrency_key,
            &retry_policy,
            &task.sandbox_profile,
            DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            DEFAULT_OVERALL_TIMEOUT_SECONDS,
        )
        .await
        .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to create run", e))?;

        Ok(run.id)
    }

    /// Re-queue a terminal run with `attempt` reset to 1 -- an explicit
    /// operator-driven retry, distinct from the scheduler's own
    /// attempt-incrementing backoff retry.
    pub async fn retry_run(&self, run_id: Uuid) -> CoreResult<Uuid> {
        let previous = self.fetch_run(run_id).await?;
        if !previous.state.is_terminal() {
            return Err(CoreError::precondition_failed(format!(
                "run {run_id} has state {}, expected a terminal state",
                previous.state
            )));
        }

        let run = db::insert_run(
            &self.pool,
            previous.task_id,
            previous.repository_id,
            1,
            previous.concurrency_key.as_deref(),
            &previous.retry_policy,
            &previous.sandbox_profile,
            previous.timeout_execution_seconds,
            previous.timeout_overall_seconds,
        )
        .await
        .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to retry run", e))?;

        Ok(run.id)
    }

    /// Cancel a run. Idempotent. Queued/PendingApproval runs transition
    /// directly; Running runs are stopped gracefully with `grace` to
    /// complete before a force-kill escalation.
    pub async fn cancel_run(&self, run_id: Uuid, grace: std::time::Duration) -> CoreResult<()> {
        let run = self.fetch_run(run_id).await?;
        if run.state.is_terminal() {
            return Ok(());
        }

        if run.state != RunState::Running {
            RunStateMachine::cancel(&self.pool, run_id).await?;
            return Ok(());
        }

        if let Some(runtime_id) = run.dispatched_to_runtime_id {
            if let Err(e) = self.gateway.stop_job(runtime_id, run_id).await {
                tracing::warn!(run_id = %run_id, error = %e, "stop_job failed during cancellation");
            }
        }

        let mut run_ids = HashSet::new();
        run_ids.insert(run_id);
        let (sub_id, mut rx) = self.event_bus.subscribe(Some(run_ids));
        let completed_in_time = tokio::time::timeout(grace, async {
            while let Some(event) = rx.recv().await {
                if event.category == EventCategory::RunCompleted {
                    return;
                }
            }
        })
        .await
        .is_ok();
        self.event_bus.unsubscribe(sub_id);

        let refreshed = self.fetch_run(run_id).await?;
        if refreshed.state.is_terminal() {
            return Ok(());
        }

        if !completed_in_time {
            if let Some(runtime_id) = run.dispatched_to_runtime_id {
                if let Ok(runtime) = self.runtime_pool.get(runtime_id).await {
                    if let Some(container_id) = runtime.container_id {
                        let _ = self.gateway.kill_container(runtime_id, &container_id).await;
                    }
                }
                let _ = self.runtime_pool.release_lease(runtime_id).await;
            }
        }

        RunStateMachine::cancel(&self.pool, run_id).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> CoreResult<Run> {
        self.fetch_run(run_id).await
    }

    pub async fn list_runs(&self, filter: RunFilter) -> CoreResult<Vec<Run>> {
        match (filter.task_id, filter.repository_id) {
            (Some(task_id), _) => db::list_runs_for_task(&self.pool, task_id)
                .await
                .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list runs for task", e)),
            (None, Some(repository_id)) => db::list_runs_for_repository(&self.pool, repository_id)
                .await
                .map_err(|e| {
                    CoreError::with_source(ErrorKind::InternalError, "failed to list runs for repository", e)
                }),
            (None, None) => Err(CoreError::invalid_input(
                "list_runs requires a task_id or repository_id filter",
            )),
        }
    }

    // -- Tick loop (spec §4.1) -----------------------------------------

    /// One scheduler tick: rank queued candidates, evaluate admission
    /// rules, and dispatch everything that clears them.
    pub async fn tick(&self) -> CoreResult<TickReport> {
        let candidates = db::list_queued_candidates(&self.pool, 500)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list queued candidates", e))?;
        let ranked = rank_round_robin(candidates);

        let mut counters = AdmissionCounters::load(&self.pool).await?;
        let mut report = TickReport::default();

        for run in ranked {
            match self.try_admit_and_dispatch(&run, &mut counters).await? {
                Admission::Dispatched => report.dispatched.push(run.id),
                Admission::Deferred => report.deferred.push(run.id),
                Admission::Failed => report.failed.push(run.id),
            }
        }

        Ok(report)
    }

    async fn try_admit_and_dispatch(&self, run: &Run, counters: &mut AdmissionCounters) -> CoreResult<Admission> {
        if counters.global_running >= self.config.max_global_concurrent_runs {
            return Ok(Admission::Deferred);
        }

        let repo_running = counters.repo_count(run.repository_id).await?;
        if let Some(limit) = self.config.per_repo_concurrency_limit {
            if repo_running >= limit {
                return Ok(Admission::Deferred);
            }
        }

        if let Some(project_limit) = self.config.per_project_concurrency_limit {
            if let Some(project_key) = counters.project_key(run.repository_id).await? {
                let project_running = counters.project_count(&project_key).await?;
                if project_running >= project_limit {
                    return Ok(Admission::Deferred);
                }
            }
        }

        let task = self.fetch_task(run.task_id).await?;
        if let Some(limit) = task.concurrency_limit {
            let task_running = counters.task_count(run.task_id).await?;
            if task_running >= limit as u32 {
                return Ok(Admission::Deferred);
            }
        }

        if let Some(key) = &run.concurrency_key {
            let key_running = counters.concurrency_key_count(key).await?;
            if key_running >= 1 {
                return Ok(Admission::Deferred);
            }
        }

        if !task.enabled {
            return Ok(Admission::Deferred);
        }

        match self.runtime_pool.acquire_lease(run.repository_id, run.task_id).await? {
            LeaseOutcome::Deferred => Ok(Admission::Deferred),
            LeaseOutcome::Acquired(lease) => {
                match self.dispatch(run, &task, lease.runtime_id, lease.container_id, lease.endpoint).await {
                    Ok(()) => {
                        counters.record_admission(run.repository_id, run.task_id, run.concurrency_key.as_deref());
                        Ok(Admission::Dispatched)
                    }
                    Err(_) => Ok(Admission::Failed),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        run: &Run,
        task: &fleetd_db::models::Task,
        runtime_id: Uuid,
        container_id: Option<String>,
        _endpoint: Option<String>,
    ) -> CoreResult<()> {
        let execution_token = self.idgen.new_id();
        RunStateMachine::dispatch(&self.pool, run.id, execution_token, runtime_id).await?;

        let sandbox_profile: SandboxProfile =
            serde_json::from_value(run.sandbox_profile.clone()).unwrap_or_default();
        let artifact_policy: ArtifactPolicy =
            serde_json::from_value(task.artifact_policy.clone()).unwrap_or_default();

        let request = DispatchJobRequest {
            run_id: run.id,
            repository_id: run.repository_id,
            task_id: run.task_id,
            harness_type: task.harness_name.clone(),
            image_tag: String::new(),
            clone_url: String::new(),
            branch: None,
            commit_sha: None,
            working_directory: None,
            instruction: String::new(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            concurrency_key: run.concurrency_key.clone(),
            timeout_seconds: run.timeout_execution_seconds as u32,
            retry_count: (run.attempt - 1).max(0) as u32,
            artifact_patterns: Vec::new(),
            linked_failure_runs: Vec::new(),
            custom_args: None,
            dispatched_at: self.clock.now(),
            container_labels: HashMap::new(),
            attempt: run.attempt as u32,
            sandbox_profile,
            artifact_policy,
        };

        match self.gateway.dispatch_job(runtime_id, request).await {
            Ok(response) if response.success => Ok(()),
            Ok(response) => {
                self.handle_dispatch_failure(
                    run,
                    runtime_id,
                    container_id,
                    classify_dispatch_failure(response.error_message.as_deref().unwrap_or("")),
                    response.error_message.unwrap_or_else(|| "dispatch failed".to_string()),
                )
                .await
            }
            Err(e) => {
                let message = e.to_string();
                let kind = classify_dispatch_failure(&message);
                self.handle_dispatch_failure(run, runtime_id, container_id, kind, message).await
            }
        }
    }

    async fn handle_dispatch_failure(
        &self,
        run: &Run,
        runtime_id: Uuid,
        _container_id: Option<String>,
        kind: ErrorKind,
        message: String,
    ) -> CoreResult<()> {
        let _ = self.runtime_pool.release_lease(runtime_id).await;

        RunStateMachine::complete(
            &self.pool,
            run.id,
            RunState::Running,
            RunState::Failed,
            None,
            Some(&message),
            Some(kind.code()),
        )
        .await?;

        if kind.is_retryable() {
            self.maybe_schedule_retry(run).await;
        }

        Err(CoreError::new(kind, message))
    }

    /// Schedule an attempt+1 retry after the configured exponential
    /// backoff, if the run's retry policy allows another attempt.
    async fn maybe_schedule_retry(&self, run: &Run) {
        let max_attempts = run
            .retry_policy
            .get("maxAttempts")
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(self.retry_defaults.max_attempts as i64) as i32;
        if run.attempt >= max_attempts {
            return;
        }

        let backoff_defaults = RetryDefaults {
            max_attempts: max_attempts as u32,
            backoff_base_seconds: run
                .retry_policy
                .get("backoffBaseSeconds")
                .and_then(serde_json::Value::as_i64)
                .map(|v| v as u32)
                .unwrap_or(self.retry_defaults.backoff_base_seconds),
            backoff_multiplier: run
                .retry_policy
                .get("backoffMultiplier")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(self.retry_defaults.backoff_multiplier),
        };
        let delay = backoff_for_attempt(&backoff_defaults, run.attempt + 1);

        let pool = self.pool.clone();
        let previous = run.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = db::insert_retry_run(&pool, &previous).await {
                tracing::warn!(run_id = %previous.id, error = %e, "failed to schedule retry run");
            }
        });
    }

    // -- Completion protocol (spec §4.1), driven by the event bus -------

    /// Subscribe to the event bus and terminalize runs as their
    /// `run.completed` event arrives. Returns the listener task's handle;
    /// dropping it does not stop the task -- callers should keep it (or a
    /// cancellation token wired through the gateway) for graceful
    /// shutdown.
    pub fn spawn_completion_listener(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        let (_sub_id, mut rx) = self.event_bus.subscribe(None);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.category != EventCategory::RunCompleted {
                    continue;
                }
                if let Err(e) = scheduler.handle_run_completed_event(&event).await {
                    tracing::warn!(run_id = %event.run_id, error = %e, "failed to process run.completed event");
                }
            }
        })
    }

    async fn handle_run_completed_event(&self, event: &fleetd_db::models::RunEvent) -> CoreResult<()> {
        let run = self.fetch_run(event.run_id).await?;
        if run.state.is_terminal() {
            return Ok(());
        }

        let payload = event.payload_json.clone().unwrap_or_default();
        let status = payload.get("status").and_then(serde_json::Value::as_str).unwrap_or("failed");
        let summary = payload.get("summary").and_then(serde_json::Value::as_str);
        let error = payload.get("message").and_then(serde_json::Value::as_str);
        let error_code = payload.get("errorCode").and_then(serde_json::Value::as_str);

        let from = run.state;
        let to = match status.to_ascii_lowercase().as_str() {
            "succeeded" => RunState::Succeeded,
            "cancelled" => RunState::Cancelled,
            _ => RunState::Failed,
        };

        RunStateMachine::complete(&self.pool, run.id, from, to, summary, error, error_code).await?;

        if let Some(runtime_id) = run.dispatched_to_runtime_id {
            let _ = self.runtime_pool.release_lease(runtime_id).await;
        }

        if to == RunState::Failed {
            let kind = error_code
                .map(|code| match code {
                    "rate_limited" => ErrorKind::RateLimited,
                    "resource_exhausted" => ErrorKind::ResourceExhausted,
                    "configuration_error" => ErrorKind::ConfigurationError,
                    "permission_denied" => ErrorKind::PermissionDenied,
                    "invalid_input" => ErrorKind::InvalidInput,
                    "internal_error" => ErrorKind::InternalError,
                    _ => ErrorKind::Transient,
                })
                .unwrap_or(ErrorKind::Transient);
            if kind.is_retryable() {
                self.maybe_schedule_retry(&run).await;
            }
        }

        Ok(())
    }

    // -- Helpers --------------------------------------------------------

    async fn fetch_run(&self, run_id: Uuid) -> CoreResult<Run> {
        db::get_run(&self.pool, run_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch run", e))?
            .ok_or_else(|| CoreError::not_found(format!("run {run_id} not found")))
    }

    async fn fetch_task(&self, task_id: Uuid) -> CoreResult<fleetd_db::models::Task> {
        task_db::get_task(&self.pool, task_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch task", e))?
            .ok_or_else(|| CoreError::not_found(format!("task {task_id} not found")))
    }
}

enum Admission {
    Dispatched,
    Deferred,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_for_repo(repo: Uuid, created_at: chrono::DateTime<chrono::Utc>) -> Run {
        Run {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            repository_id: repo,
            state: RunState::Queued,
            attempt: 1,
            concurrency_key: None,
            execution_token: None,
            dispatched_to_runtime_id: None,
            retry_policy: serde_json::Value::Null,
            sandbox_profile: serde_json::Value::Null,
            timeout_execution_seconds: DEFAULT_EXECUTION_TIMEOUT_SECONDS,
            timeout_overall_seconds: DEFAULT_OVERALL_TIMEOUT_SECONDS,
            last_heartbeat_at: None,
            summary: None,
            error: None,
            error_code: None,
            created_at,
            started_at: None,
            ended_at: None,
        }
    }

    #[test]
    fn round_robin_interleaves_repositories() {
        let repo_a = Uuid::new_v4();
        let repo_b = Uuid::new_v4();
        let t0 = chrono::Utc::now();

        let candidates = vec![
            run_for_repo(repo_a, t0),
            run_for_repo(repo_a, t0 + chrono::Duration::seconds(1)),
            run_for_repo(repo_b, t0 + chrono::Duration::seconds(2)),
        ];

        let ranked = rank_round_robin(candidates);
        assert_eq!(ranked.len(), 3);
        // First pass: one from A, one from B; second pass: second from A.
        assert_eq!(ranked[0].repository_id, repo_a);
        assert_eq!(ranked[1].repository_id, repo_b);
        assert_eq!(ranked[2].repository_id, repo_a);
    }

    #[test]
    fn classify_dispatch_failure_maps_keywords() {
        assert_eq!(classify_dispatch_failure("rate limit exceeded"), ErrorKind::RateLimited);
        assert_eq!(classify_dispatch_failure("quota exhausted"), ErrorKind::ResourceExhausted);
        assert_eq!(classify_dispatch_failure("permission denied"), ErrorKind::PermissionDenied);
        assert_eq!(classify_dispatch_failure("invalid image tag"), ErrorKind::InvalidInput);
        assert_eq!(classify_dispatch_failure("connection reset"), ErrorKind::Transient);
    }

    #[test]
    fn backoff_grows_exponentially() {
        let defaults = RetryDefaults {
            max_attempts: 5,
            backoff_base_seconds: 1,
            backoff_multiplier: 2.0,
        };
        assert_eq!(backoff_for_attempt(&defaults, 1), std::time::Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(&defaults, 2), std::time::Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(&defaults, 3), std::time::Duration::from_secs(4));
    }
}
