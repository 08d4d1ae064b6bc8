//! Row structs and enums backing the Store.
//!
//! Every enum follows the same convention the rest of this workspace uses:
//! a `sqlx::Type` mapped to a `text` column, a hand-written `Display`, and a
//! `FromStr` with a dedicated parse-error type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`Run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    PendingApproval,
    Succeeded,
    Failed,
    Cancelled,
    Obsolete,
}

impl RunState {
    /// Terminal states never transition further.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Obsolete
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::PendingApproval => "pending_approval",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Obsolete => "obsolete",
        };
        f.write_str(s)
    }
}

impl FromStr for RunState {
    type Err = RunStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "pending_approval" => Ok(Self::PendingApproval),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "obsolete" => Ok(Self::Obsolete),
            other => Err(RunStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunState`] string.
#[derive(Debug, Clone)]
pub struct RunStateParseError(pub String);

impl fmt::Display for RunStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid run state: {:?}", self.0)
    }
}

impl std::error::Error for RunStateParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of a [`TaskRuntime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRuntimeState {
    Provisioning,
    Starting,
    Ready,
    Busy,
    Draining,
    Stopping,
    Stopped,
    Quarantined,
    FailedStart,
}

impl TaskRuntimeState {
    /// A runtime in this state may accept a new lease (subject to slot and
    /// freshness checks performed separately).
    pub fn accepts_leases(self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }
}

impl fmt::Display for TaskRuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Quarantined => "quarantined",
            Self::FailedStart => "failed_start",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskRuntimeState {
    type Err = TaskRuntimeStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(Self::Provisioning),
            "starting" => Ok(Self::Starting),
            "ready" => Ok(Self::Ready),
            "busy" => Ok(Self::Busy),
            "draining" => Ok(Self::Draining),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "quarantined" => Ok(Self::Quarantined),
            "failed_start" => Ok(Self::FailedStart),
            other => Err(TaskRuntimeStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskRuntimeState`] string.
#[derive(Debug, Clone)]
pub struct TaskRuntimeStateParseError(pub String);

impl fmt::Display for TaskRuntimeStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task runtime state: {:?}", self.0)
    }
}

impl std::error::Error for TaskRuntimeStateParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle state of a [`QueuedBackgroundWork`] item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackgroundWorkState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BackgroundWorkState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for BackgroundWorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for BackgroundWorkState {
    type Err = BackgroundWorkStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(BackgroundWorkStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackgroundWorkState`] string.
#[derive(Debug, Clone)]
pub struct BackgroundWorkStateParseError(pub String);

impl fmt::Display for BackgroundWorkStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid background work state: {:?}", self.0)
    }
}

impl std::error::Error for BackgroundWorkStateParseError {}

// ---------------------------------------------------------------------------

/// Kind of ancillary async work the [`QueuedBackgroundWork`] queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BackgroundWorkKind {
    TaskRuntimeImageResolution,
    VectorBootstrap,
    RepositoryGitRefresh,
    Recovery,
    Other,
}

impl fmt::Display for BackgroundWorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskRuntimeImageResolution => "task_runtime_image_resolution",
            Self::VectorBootstrap => "vector_bootstrap",
            Self::RepositoryGitRefresh => "repository_git_refresh",
            Self::Recovery => "recovery",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for BackgroundWorkKind {
    type Err = BackgroundWorkKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_runtime_image_resolution" => Ok(Self::TaskRuntimeImageResolution),
            "vector_bootstrap" => Ok(Self::VectorBootstrap),
            "repository_git_refresh" => Ok(Self::RepositoryGitRefresh),
            "recovery" => Ok(Self::Recovery),
            "other" => Ok(Self::Other),
            other => Err(BackgroundWorkKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackgroundWorkKind`] string.
#[derive(Debug, Clone)]
pub struct BackgroundWorkKindParseError(pub String);

impl fmt::Display for BackgroundWorkKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid background work kind: {:?}", self.0)
    }
}

impl std::error::Error for BackgroundWorkKindParseError {}

// ---------------------------------------------------------------------------

/// Structured projection category for a [`RunEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    ReasoningDelta,
    AssistantDelta,
    ToolCall,
    ToolResult,
    DiffUpdated,
    RunCompleted,
    Passthrough,
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReasoningDelta => "reasoning.delta",
            Self::AssistantDelta => "assistant.delta",
            Self::ToolCall => "tool.call",
            Self::ToolResult => "tool.result",
            Self::DiffUpdated => "diff.updated",
            Self::RunCompleted => "run.completed",
            Self::Passthrough => "passthrough",
        };
        f.write_str(s)
    }
}

impl FromStr for EventCategory {
    type Err = EventCategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reasoning.delta" => Ok(Self::ReasoningDelta),
            "assistant.delta" => Ok(Self::AssistantDelta),
            "tool.call" => Ok(Self::ToolCall),
            "tool.result" => Ok(Self::ToolResult),
            "diff.updated" => Ok(Self::DiffUpdated),
            "run.completed" => Ok(Self::RunCompleted),
            "passthrough" => Ok(Self::Passthrough),
            other => Err(EventCategoryParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`EventCategory`] string.
#[derive(Debug, Clone)]
pub struct EventCategoryParseError(pub String);

impl fmt::Display for EventCategoryParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid event category: {:?}", self.0)
    }
}

impl std::error::Error for EventCategoryParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Minimal anchor row for a repository; CRUD and git plumbing live outside
/// the core, but Run/Task/TaskRuntime affinity needs a row to key off.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: Uuid,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub project_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A task -- a named unit of work bound to a repository with default
/// execution policy.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub repository_id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub harness_name: String,
    pub concurrency_limit: Option<i32>,
    pub retry_max_attempts: i32,
    pub retry_backoff_base_seconds: i32,
    pub retry_backoff_multiplier: f64,
    pub sandbox_profile: serde_json::Value,
    pub artifact_policy: serde_json::Value,
    pub approval_profile: Option<serde_json::Value>,
    pub cron_expression: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One execution attempt of a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub repository_id: Uuid,
    pub state: RunState,
    pub attempt: i32,
    pub concurrency_key: Option<String>,
    pub execution_token: Option<Uuid>,
    pub dispatched_to_runtime_id: Option<Uuid>,
    pub retry_policy: serde_json::Value,
    pub sandbox_profile: serde_json::Value,
    pub timeout_execution_seconds: i32,
    pub timeout_overall_seconds: i32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A containerized worker capable of executing one or more concurrent runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRuntime {
    pub id: Uuid,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub max_slots: i32,
    pub active_slots: i32,
    pub lifecycle_state: TaskRuntimeState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub missed_heartbeats: i32,
    pub assigned_repository_ids: Vec<Uuid>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// An append-only event published by a runtime during a run's execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunEvent {
    pub delivery_id: i64,
    pub run_id: Uuid,
    pub task_id: Uuid,
    pub execution_token: Option<Uuid>,
    pub sequence: i64,
    pub category: EventCategory,
    pub schema_version: i32,
    pub payload_json: Option<serde_json::Value>,
    pub content_type: Option<String>,
    pub command_id: Option<String>,
    pub artifact_id: Option<String>,
    pub chunk_index: Option<i32>,
    pub is_last_chunk: Option<bool>,
    pub recorded_at: DateTime<Utc>,
}

/// An entry in the bounded, deduplicated background work queue.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueuedBackgroundWork {
    pub id: Uuid,
    pub operation_key: String,
    pub kind: BackgroundWorkKind,
    pub state: BackgroundWorkState,
    pub percent: Option<i32>,
    pub message: Option<String>,
    pub error_code: Option<String>,
    pub is_critical: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_display_roundtrip() {
        let variants = [
            RunState::Queued,
            RunState::Running,
            RunState::PendingApproval,
            RunState::Succeeded,
            RunState::Failed,
            RunState::Cancelled,
            RunState::Obsolete,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn run_state_invalid() {
        assert!("bogus".parse::<RunState>().is_err());
    }

    #[test]
    fn run_state_terminal_classification() {
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(!RunState::PendingApproval.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
        assert!(RunState::Obsolete.is_terminal());
    }

    #[test]
    fn task_runtime_state_display_roundtrip() {
        let variants = [
            TaskRuntimeState::Provisioning,
            TaskRuntimeState::Starting,
            TaskRuntimeState::Ready,
            TaskRuntimeState::Busy,
            TaskRuntimeState::Draining,
            TaskRuntimeState::Stopping,
            TaskRuntimeState::Stopped,
            TaskRuntimeState::Quarantined,
            TaskRuntimeState::FailedStart,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskRuntimeState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_runtime_state_invalid() {
        assert!("nope".parse::<TaskRuntimeState>().is_err());
    }

    #[test]
    fn task_runtime_accepts_leases() {
        assert!(TaskRuntimeState::Ready.accepts_leases());
        assert!(TaskRuntimeState::Busy.accepts_leases());
        assert!(!TaskRuntimeState::Draining.accepts_leases());
        assert!(!TaskRuntimeState::Quarantined.accepts_leases());
    }

    #[test]
    fn background_work_state_display_roundtrip() {
        let variants = [
            BackgroundWorkState::Pending,
            BackgroundWorkState::Running,
            BackgroundWorkState::Succeeded,
            BackgroundWorkState::Failed,
            BackgroundWorkState::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BackgroundWorkState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn background_work_state_active_classification() {
        assert!(BackgroundWorkState::Pending.is_active());
        assert!(BackgroundWorkState::Running.is_active());
        assert!(!BackgroundWorkState::Succeeded.is_active());
        assert!(BackgroundWorkState::Succeeded.is_terminal());
    }

    #[test]
    fn background_work_kind_display_roundtrip() {
        let variants = [
            BackgroundWorkKind::TaskRuntimeImageResolution,
            BackgroundWorkKind::VectorBootstrap,
            BackgroundWorkKind::RepositoryGitRefresh,
            BackgroundWorkKind::Recovery,
            BackgroundWorkKind::Other,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: BackgroundWorkKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_category_display_roundtrip() {
        let variants = [
            EventCategory::ReasoningDelta,
            EventCategory::AssistantDelta,
            EventCategory::ToolCall,
            EventCategory::ToolResult,
            EventCategory::DiffUpdated,
            EventCategory::RunCompleted,
            EventCategory::Passthrough,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: EventCategory = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn event_category_invalid() {
        assert!("bogus.category".parse::<EventCategory>().is_err());
    }
}
