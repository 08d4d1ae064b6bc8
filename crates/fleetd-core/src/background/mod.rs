//! `BackgroundWorkCoordinator`: bounded, deduplicated, progress-tracked
//! execution of ancillary async work (image pulls, git refreshes, crash
//! recovery).
//!
//! No direct teacher analog -- the closest relative is the ambient
//! subprocess-running shape in `gator-core/src/invariant/runner.rs` (spawn,
//! await, classify outcome) -- built fresh following Design Note §9's
//! guidance to model the "updates" event as a broadcast channel with
//! isolated handler failures.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Mutex;

use futures::FutureExt;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fleetd_db::models::{BackgroundWorkKind, BackgroundWorkState, QueuedBackgroundWork};
use fleetd_db::queries::background_work as db;

use crate::error::{CoreError, CoreResult, ErrorKind};

/// Default number of concurrent executors (spec §4.4).
pub const DEFAULT_CONCURRENCY: usize = 4;
/// Default cap on retained terminal snapshots (spec §3).
pub const DEFAULT_MAX_RETAINED_SNAPSHOTS: i64 = 256;

/// Reports progress for a single unit of background work. Percent is
/// clamped to 0-100; updates are persisted and broadcast on every call.
pub struct ProgressReporter {
    work_id: Uuid,
    pool: PgPool,
    updated_tx: broadcast::Sender<QueuedBackgroundWork>,
}

impl ProgressReporter {
    pub async fn report(&self, percent: i32, message: Option<&str>) -> CoreResult<()> {
        let clamped = percent.clamp(0, 100);
        db::update_progress(&self.pool, self.work_id, clamped, message)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to update work progress", e))?;

        if let Ok(Some(snapshot)) = db::get_work(&self.pool, self.work_id).await {
            let _ = self.updated_tx.send(snapshot);
        }
        Ok(())
    }
}

/// A unit of async work: takes a progress reporter and a cancellation
/// signal, returns `Ok(())` on success or an error to be recorded as a
/// failure.
pub type WorkFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type WorkFn = Box<dyn FnOnce(ProgressReporter, CancellationToken) -> WorkFuture + Send>;

struct Job {
    work_id: Uuid,
    work: WorkFn,
}

/// Bounded, deduplicated, progress-tracked executor for ancillary async
/// work.
pub struct BackgroundWorkCoordinator {
    pool: PgPool,
    max_retained: i64,
    job_tx: mpsc::UnboundedSender<Job>,
    updated_tx: broadcast::Sender<QueuedBackgroundWork>,
    listeners: Mutex<Vec<Box<dyn Fn(&QueuedBackgroundWork) + Send + Sync>>>,
    shutdown: CancellationToken,
}

impl BackgroundWorkCoordinator {
    /// Construct the coordinator and spawn `concurrency` executor tasks.
    pub fn new(pool: PgPool, concurrency: usize, max_retained: i64) -> std::sync::Arc<Self> {
        let (job_tx, job_rx) = mpsc::unbounded_channel::<Job>();
        let (updated_tx, _) = broadcast::channel(1024);
        let shutdown = CancellationToken::new();

        let coordinator = std::sync::Arc::new(Self {
            pool,
            max_retained,
            job_tx,
            updated_tx,
            listeners: Mutex::new(Vec::new()),
            shutdown,
        });

        let job_rx = std::sync::Arc::new(tokio::sync::Mutex::new(job_rx));
        for _ in 0..concurrency.max(1) {
            let coordinator = coordinator.clone();
            let job_rx = job_rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = job_rx.lock().await;
                        tokio::select! {
                            biased;
                            _ = coordinator.shutdown.cancelled() => None,
                            job = rx.recv() => job,
                        }
                    };
                    let Some(job) = job else { break };
                    coordinator.execute(job).await;
                }
            });
        }

        coordinator
    }

    /// Construct with the spec defaults (4 executors, 256 retained
    /// snapshots).
    pub fn with_defaults(pool: PgPool) -> std::sync::Arc<Self> {
        Self::new(pool, DEFAULT_CONCURRENCY, DEFAULT_MAX_RETAINED_SNAPSHOTS)
    }

    /// Enqueue a unit of work. If `dedupe_by_key` and an active
    /// (Pending/Running) entry already exists for `operation_key`, returns
    /// its `workId` without running `work`.
    pub async fn enqueue(
        &self,
        kind: BackgroundWorkKind,
        operation_key: &str,
        dedupe_by_key: bool,
        is_critical: bool,
        work: WorkFn,
    ) -> CoreResult<Uuid> {
        if dedupe_by_key {
            if let Some(existing) = db::find_active_by_operation_key(&self.pool, operation_key)
                .await
                .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to look up background work", e))?
            {
                return Ok(existing.id);
            }
        }

        let entry = db::insert_work(&self.pool, operation_key, kind, is_critical)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to enqueue background work", e))?;

        self.job_tx
            .send(Job {
                work_id: entry.id,
                work,
            })
            .map_err(|_| CoreError::internal("background work coordinator is shut down"))?;

        Ok(entry.id)
    }

    async fn execute(&self, job: Job) {
        if db::mark_running(&self.pool, job.work_id).await.unwrap_or(0) == 0 {
            // Lost a race (e.g. cancelled before a worker picked it up).
            return;
        }
        self.notify(job.work_id).await;

        let reporter = ProgressReporter {
            work_id: job.work_id,
            pool: self.pool.clone(),
            updated_tx: self.updated_tx.clone(),
        };
        let token = self.shutdown.child_token();

        // Isolate a panicking work closure from the executor loop itself.
        let result = AssertUnwindSafe((job.work)(reporter, token))
            .catch_unwind()
            .await;

        let (to, error_code, message) = match result {
            Ok(Ok(())) => (BackgroundWorkState::Succeeded, None, None),
            Ok(Err(e)) => (
                BackgroundWorkState::Failed,
                Some("work_failed".to_string()),
                Some(e.to_string()),
            ),
            Err(_) => (
                BackgroundWorkState::Failed,
                Some("work_panicked".to_string()),
                Some("background work panicked".to_string()),
            ),
        };

        let _ = db::complete_work(
            &self.pool,
            job.work_id,
            to,
            error_code.as_deref(),
            message.as_deref(),
        )
        .await;
        self.notify(job.work_id).await;

        let _ = db::prune_terminal_beyond(&self.pool, self.max_retained).await;
    }

    async fn notify(&self, work_id: Uuid) {
        if let Ok(Some(snapshot)) = db::get_work(&self.pool, work_id).await {
            let _ = self.updated_tx.send(snapshot.clone());
            let listeners = self.listeners.lock().unwrap();
            for listener in listeners.iter() {
                // Each listener is isolated: a panicking handler must not
                // prevent the rest from observing the transition.
                let _ = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&snapshot)));
            }
        }
    }

    /// Subscribe to every snapshot transition via a broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<QueuedBackgroundWork> {
        self.updated_tx.subscribe()
    }

    /// Register a synchronous listener invoked (isolated from its peers)
    /// on every snapshot transition, in addition to the broadcast channel.
    pub fn on_update(&self, listener: Box<dyn Fn(&QueuedBackgroundWork) + Send + Sync>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Look up a single snapshot by id.
    pub async fn try_get(&self, work_id: Uuid) -> CoreResult<Option<QueuedBackgroundWork>> {
        db::get_work(&self.pool, work_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch background work", e))
    }

    /// Snapshot of every entry, newest first.
    pub async fn snapshot(&self) -> CoreResult<Vec<QueuedBackgroundWork>> {
        db::list_snapshots(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to snapshot background work", e))
    }

    /// Signal shutdown: in-flight work observes its cancellation token;
    /// callers should apply their own grace period before forcing a stop.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_work() -> WorkFn {
        Box::new(|reporter: ProgressReporter, _token: CancellationToken| {
            Box::pin(async move {
                reporter.report(100, Some("done")).await.ok();
                Ok(())
            })
        })
    }

    fn failing_work(message: &'static str) -> WorkFn {
        Box::new(move |_reporter: ProgressReporter, _token: CancellationToken| {
            Box::pin(async move { Err(anyhow::anyhow!(message)) })
        })
    }

    #[test]
    fn work_fn_boxes_compile_for_success_and_failure() {
        // Compilation check: both helpers must satisfy the `WorkFn` bound.
        let _success: WorkFn = ok_work();
        let _failure: WorkFn = failing_work("boom");
    }
}
