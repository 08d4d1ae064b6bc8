//! `EventBus`: fan-out of ordered runtime events to subscribers, with a
//! durable backlog for replay and structured projection of harness JSON
//! frames.
//!
//! Grounded on `gator-core/src/lifecycle/mod.rs`'s best-effort event
//! persistence (`collect_events`) for the publish-then-persist shape, and on
//! `gator-core/src/harness/claude_code.rs`'s JSONL frame parsing for the
//! projection step. The subscription/fan-out layer itself has no teacher
//! analog and follows Design Note §9's multicaster pattern: a map of
//! subscriber handles, each owning a bounded channel, non-blocking publish.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use fleetd_db::models::{EventCategory, RunEvent};
use fleetd_db::queries::events as db;
pub use fleetd_db::queries::events::NewRunEvent;

use crate::error::{CoreError, CoreResult, ErrorKind};

/// Harness frames carrying this marker are eligible for structured
/// projection (spec §4.3).
pub const HARNESS_EVENT_MARKER: &str = "agentsdashboard.harness-runtime-event.v1";

/// Default schema version applied when a harness frame doesn't carry one.
pub const DEFAULT_SCHEMA_VERSION: i32 = 1;

/// Default per-subscriber channel capacity. Exceeding this drops in-memory
/// delivery for that subscriber; the durable backlog remains readable.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// A subscriber's filter: `None` means "all runs".
enum Scope {
    All,
    Runs(HashSet<Uuid>),
}

struct Subscriber {
    scope: Scope,
    sender: tokio::sync::mpsc::Sender<RunEvent>,
}

/// Response to a backlog read.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogPage {
    pub events: Vec<RunEvent>,
    pub last_delivery_id: i64,
    pub has_more: bool,
}

/// Warnings collected while validating a harness-produced JSON envelope.
/// Unknown top-level keys are warnings, not errors (spec §4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeWarnings(pub Vec<String>);

const KNOWN_ENVELOPE_KEYS: &[&str] = &["status", "actions", "artifacts", "metrics", "metadata"];
const VALID_STATUSES: &[&str] = &["succeeded", "failed", "unknown", "cancelled", "pending"];

/// Validate a harness-produced JSON envelope per spec §4.3. Returns the
/// warnings collected for unknown top-level keys, or a
/// [`CoreError::invalid_input`] for a structural violation.
pub fn validate_envelope(envelope: &Value) -> CoreResult<EnvelopeWarnings> {
    let obj = envelope
        .as_object()
        .ok_or_else(|| CoreError::invalid_input("harness envelope must be a JSON object"))?;

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::invalid_input("harness envelope missing required `status`"))?;
    if !VALID_STATUSES.contains(&status.to_ascii_lowercase().as_str()) {
        return Err(CoreError::invalid_input(format!(
            "harness envelope has invalid status {status:?}"
        )));
    }

    if let Some(actions) = obj.get("actions") {
        let actions = actions
            .as_array()
            .ok_or_else(|| CoreError::invalid_input("`actions` must be an array"))?;
        for action in actions {
            let action = action
                .as_object()
                .ok_or_else(|| CoreError::invalid_input("each action must be an object"))?;
            if !matches!(action.get("type"), Some(Value::String(_))) {
                return Err(CoreError::invalid_input(
                    "each action must carry a string `type`",
                ));
            }
        }
    }

    if let Some(artifacts) = obj.get("artifacts") {
        let artifacts = artifacts
            .as_array()
            .ok_or_else(|| CoreError::invalid_input("`artifacts` must be an array"))?;
        for artifact in artifacts {
            match artifact.as_str() {
                Some(s) if !s.is_empty() => {}
                _ => {
                    return Err(CoreError::invalid_input(
                        "each artifact must be a non-empty string",
                    ));
                }
            }
        }
    }

    if let Some(metrics) = obj.get("metrics").and_then(Value::as_object) {
        for (key, value) in metrics {
            if !value.is_number() {
                return Err(CoreError::invalid_input(format!(
                    "metric {key:?} must be a number"
                )));
            }
        }
    }

    if let Some(metadata) = obj.get("metadata").and_then(Value::as_object) {
        for (key, value) in metadata {
            if !value.is_string() {
                return Err(CoreError::invalid_input(format!(
                    "metadata {key:?} must be a string"
                )));
            }
        }
    }

    let warnings = obj
        .keys()
        .filter(|k| !KNOWN_ENVELOPE_KEYS.contains(&k.as_str()))
        .map(|k| format!("unknown top-level key: {k}"))
        .collect();

    Ok(EnvelopeWarnings(warnings))
}

/// Project a raw harness JSON frame into a structured `(category,
/// schema_version)` pair per spec §4.3. Frames without the harness marker
/// pass through unprojected.
pub fn project_harness_frame(frame: &Value) -> (EventCategory, i32) {
    let schema_version = frame
        .get("schemaVersion")
        .and_then(Value::as_i64)
        .map(|v| v as i32)
        .unwrap_or(DEFAULT_SCHEMA_VERSION);

    let is_marked = frame
        .get("marker")
        .and_then(Value::as_str)
        .map(|m| m == HARNESS_EVENT_MARKER)
        .unwrap_or(false);

    if !is_marked {
        return (EventCategory::Passthrough, schema_version);
    }

    let category = match frame.get("kind").and_then(Value::as_str) {
        Some("reasoning.delta") => EventCategory::ReasoningDelta,
        Some("assistant.delta") => EventCategory::AssistantDelta,
        Some("tool.call") => EventCategory::ToolCall,
        Some("tool.result") => EventCategory::ToolResult,
        Some("diff.updated") => EventCategory::DiffUpdated,
        Some("run.completed") => EventCategory::RunCompleted,
        _ => EventCategory::Passthrough,
    };

    (category, schema_version)
}

/// Fan-out bus: accepts published events, persists them durably, and
/// forwards them to every matching live subscriber.
pub struct EventBus {
    pool: PgPool,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
}

impl EventBus {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a new event and fan it out to matching subscribers.
    /// Delivery is non-blocking: a subscriber whose channel is full simply
    /// misses this live delivery and must catch up via
    /// [`EventBus::read_backlog`].
    pub async fn publish(&self, new: NewRunEvent) -> CoreResult<RunEvent> {
        let run_id = new.run_id;
        let event = db::insert_run_event(&self.pool, &new)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to publish run event", e))?;

        let subscribers = self.subscribers.lock().unwrap();
        for subscriber in subscribers.values() {
            let matches = match &subscriber.scope {
                Scope::All => true,
                Scope::Runs(ids) => ids.contains(&run_id),
            };
            if matches {
                // try_send: never block the publisher on a slow subscriber.
                let _ = subscriber.sender.try_send(event.clone());
            }
        }

        Ok(event)
    }

    /// Subscribe to "all" (`run_ids = None`) or a specific set of runs.
    /// Returns a handle to unsubscribe and a receiver of live events.
    /// Idempotent: each call creates an independent subscription.
    pub fn subscribe(
        &self,
        run_ids: Option<HashSet<Uuid>>,
    ) -> (Uuid, tokio::sync::mpsc::Receiver<RunEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let scope = match run_ids {
            Some(ids) => Scope::Runs(ids),
            None => Scope::All,
        };
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { scope, sender: tx });
        (id, rx)
    }

    /// Drop a subscription. A no-op if already unsubscribed.
    pub fn unsubscribe(&self, subscription_id: Uuid) {
        self.subscribers.lock().unwrap().remove(&subscription_id);
    }

    /// Number of live subscriptions, for tests and diagnostics.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Durable backlog replay, capped at 500 events per spec §6.3.
    pub async fn read_backlog(&self, after_delivery_id: i64, max_events: i64) -> CoreResult<BacklogPage> {
        let max_events = max_events.clamp(1, 500);
        let events = db::read_backlog(&self.pool, after_delivery_id, max_events)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to read event backlog", e))?;
        let global_max = db::max_delivery_id(&self.pool)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to read max delivery id", e))?;

        let last_delivery_id = events.last().map(|e| e.delivery_id).unwrap_or(after_delivery_id);
        let has_more = last_delivery_id < global_max;

        Ok(BacklogPage {
            events,
            last_delivery_id,
            has_more,
        })
    }

    /// Events for a single run in `sequence` order.
    pub async fn events_for_run(&self, run_id: Uuid) -> CoreResult<Vec<RunEvent>> {
        db::list_events_for_run(&self.pool, run_id)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to list events for run", e))
    }

    /// Enforce bounded backlog retention for a single run, keeping the most
    /// recent `retain_count` events by sequence.
    pub async fn prune_backlog(&self, run_id: Uuid, retain_count: i64) -> CoreResult<u64> {
        db::prune_old_events_for_run(&self.pool, run_id, retain_count)
            .await
            .map_err(|e| CoreError::with_source(ErrorKind::InternalError, "failed to prune event backlog", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_envelope_accepts_well_formed_frame() {
        let envelope = json!({
            "status": "Succeeded",
            "actions": [{"type": "tool.call", "name": "edit"}],
            "artifacts": ["diff.patch"],
            "metrics": {"tokens": 120},
            "metadata": {"model": "claude"},
        });
        let warnings = validate_envelope(&envelope).expect("should validate");
        assert!(warnings.0.is_empty());
    }

    #[test]
    fn validate_envelope_rejects_missing_status() {
        let envelope = json!({"actions": []});
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn validate_envelope_rejects_invalid_status() {
        let envelope = json!({"status": "maybe"});
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn validate_envelope_rejects_action_without_type() {
        let envelope = json!({"status": "pending", "actions": [{"name": "edit"}]});
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn validate_envelope_rejects_non_string_artifact() {
        let envelope = json!({"status": "pending", "artifacts": [42]});
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn validate_envelope_rejects_non_numeric_metric() {
        let envelope = json!({"status": "pending", "metrics": {"tokens": "many"}});
        assert!(validate_envelope(&envelope).is_err());
    }

    #[test]
    fn validate_envelope_warns_on_unknown_keys() {
        let envelope = json!({"status": "pending", "extra_field": 1});
        let warnings = validate_envelope(&envelope).unwrap();
        assert_eq!(warnings.0.len(), 1);
        assert!(warnings.0[0].contains("extra_field"));
    }

    #[test]
    fn project_harness_frame_recognizes_marked_categories() {
        let frame = json!({
            "marker": HARNESS_EVENT_MARKER,
            "kind": "tool.call",
            "schemaVersion": 3,
        });
        let (category, version) = project_harness_frame(&frame);
        assert_eq!(category, EventCategory::ToolCall);
        assert_eq!(version, 3);
    }

    #[test]
    fn project_harness_frame_passes_through_unmarked() {
        let frame = json!({"kind": "tool.call"});
        let (category, version) = project_harness_frame(&frame);
        assert_eq!(category, EventCategory::Passthrough);
        assert_eq!(version, DEFAULT_SCHEMA_VERSION);
    }

    #[test]
    fn project_harness_frame_defaults_unknown_marked_kind() {
        let frame = json!({"marker": HARNESS_EVENT_MARKER, "kind": "something.else"});
        let (category, _) = project_harness_frame(&frame);
        assert_eq!(category, EventCategory::Passthrough);
    }
}
