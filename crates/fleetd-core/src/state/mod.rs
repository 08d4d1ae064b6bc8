//! Run state machine transitions.
//!
//! Validates and executes state transitions for runs, enforcing the
//! allowed transition graph, optimistic locking, and timestamp management.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::models::{Run, RunState};
use fleetd_db::queries::runs as db;

use crate::error::{CoreError, CoreResult, ErrorKind};

/// The run state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// queued           -> running
/// queued           -> cancelled
/// running          -> pending_approval
/// running          -> succeeded
/// running          -> failed
/// running          -> cancelled
/// pending_approval -> succeeded
/// pending_approval -> failed
/// pending_approval -> cancelled
/// ```
///
/// `failed`/`succeeded`/`cancelled`/`obsolete` are terminal: no outgoing
/// edges. A fresh retry attempt is a brand new Queued row sharing `taskId`,
/// not a re-entry of the same row (see [`fleetd_db::queries::runs::insert_retry_run`]).
pub struct RunStateMachine;

impl RunStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: RunState, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (from, to),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, PendingApproval)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (PendingApproval, Succeeded)
                | (PendingApproval, Failed)
                | (PendingApproval, Cancelled)
        )
    }

    /// Dispatch a Queued run to Running, minting `executionToken` and
    /// recording the target runtime. Optimistically locked on `state =
    /// 'queued'`: a racing dispatcher never double-admits the same run.
    pub async fn dispatch(
        pool: &PgPool,
        run_id: Uuid,
        execution_token: Uuid,
        dispatched_to_runtime_id: Uuid,
    ) -> CoreResult<()> {
        let rows = db::dispatch_run(pool, run_id, execution_token, dispatched_to_runtime_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to dispatch run", e))?;

        if rows == 0 {
            let run = Self::fetch(pool, run_id).await?;
            return Err(CoreError::precondition_failed(format!(
                "run {run_id} has state {}, expected queued",
                run.state
            )));
        }

        Ok(())
    }

    /// Transition a run into a terminal state, recording summary/error
    /// fields. `from` is the expected current state (`Running` or
    /// `PendingApproval`).
    pub async fn complete(
        pool: &PgPool,
        run_id: Uuid,
        from: RunState,
        to: RunState,
        summary: Option<&str>,
        error: Option<&str>,
        error_code: Option<&str>,
    ) -> CoreResult<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(CoreError::invalid_input(format!(
                "invalid state transition: {from} -> {to} for run {run_id}"
            )));
        }

        let rows = db::complete_run(pool, run_id, from, to, summary, error, error_code)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to complete run", e))?;

        if rows == 0 {
            let run = Self::fetch(pool, run_id).await?;
            return Err(CoreError::precondition_failed(format!(
                "run {run_id} has state {}, expected {from}",
                run.state
            )));
        }

        Ok(())
    }

    /// Transition `running -> pending_approval`. Used when a task carries
    /// an `approvalProfile` gate between execution and the terminal states.
    pub async fn request_approval(pool: &PgPool, run_id: Uuid) -> CoreResult<()> {
        if !Self::is_valid_transition(RunState::Running, RunState::PendingApproval) {
            unreachable!("running -> pending_approval is always a valid edge");
        }
        let rows = sqlx::query(
            "UPDATE runs SET state = 'pending_approval' WHERE id = $1 AND state = 'running'",
        )
        .bind(run_id)
        .execute(pool)
        .await
        .map_err(|e| {
            CoreError::with_source(ErrorKind::InternalError, "failed to request approval", e.into())
        })?
        .rows_affected();

        if rows == 0 {
            let run = Self::fetch(pool, run_id).await?;
            return Err(CoreError::precondition_failed(format!(
                "run {run_id} has state {}, expected running",
                run.state
            )));
        }

        Ok(())
    }

    /// Cancel a run. Idempotent: cancelling an already-terminal run affects
    /// zero rows, which is not an error.
    pub async fn cancel(pool: &PgPool, run_id: Uuid) -> CoreResult<()> {
        db::cancel_run(pool, run_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to cancel run", e))?;
        Ok(())
    }

    async fn fetch(pool: &PgPool, run_id: Uuid) -> CoreResult<Run> {
        db::get_run(pool, run_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to fetch run", e))?
            .ok_or_else(|| CoreError::not_found(format!("run {run_id} not found")))
    }
}

/// Timestamp helper: every transition into a terminal state stamps
/// `endedAt = now()` at the database layer; this mirrors that choice for
/// callers that need to display it before re-fetching.
pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        assert!(RunStateMachine::is_valid_transition(
            RunState::Queued,
            RunState::Running
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunState::Running,
            RunState::Succeeded
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunState::Running,
            RunState::PendingApproval
        ));
        assert!(RunStateMachine::is_valid_transition(
            RunState::PendingApproval,
            RunState::Succeeded
        ));
    }

    #[test]
    fn invalid_transitions() {
        assert!(!RunStateMachine::is_valid_transition(
            RunState::Queued,
            RunState::Succeeded
        ));
        assert!(!RunStateMachine::is_valid_transition(
            RunState::Succeeded,
            RunState::Running
        ));
        assert!(!RunStateMachine::is_valid_transition(
            RunState::Failed,
            RunState::Queued
        ));
    }

    #[test]
    fn no_outgoing_edges_from_terminal_states() {
        for terminal in [
            RunState::Succeeded,
            RunState::Failed,
            RunState::Cancelled,
            RunState::Obsolete,
        ] {
            for to in [
                RunState::Queued,
                RunState::Running,
                RunState::PendingApproval,
                RunState::Succeeded,
                RunState::Failed,
                RunState::Cancelled,
                RunState::Obsolete,
            ] {
                assert!(!RunStateMachine::is_valid_transition(terminal, to));
            }
        }
    }
}
