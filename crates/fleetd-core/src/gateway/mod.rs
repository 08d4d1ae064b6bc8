//! The `RuntimeGateway` trait -- the wire protocol spoken to task-runtimes.
//!
//! The concrete Docker driver and individual harness adapters are explicitly
//! out of scope for this core (spec §1): this module only defines the
//! object-safe trait and wire-level request/reply shapes, plus a
//! `LocalGateway` in-process reference implementation used by tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// CPU/memory/network constraints applied to a dispatched run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxProfile {
    pub cpu_limit: Option<f64>,
    pub memory_limit: Option<u64>,
    pub network_disabled: bool,
    pub read_only_root_fs: bool,
}

/// Artifact collection limits applied to a dispatched run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactPolicy {
    pub max_artifacts: Option<u32>,
    pub max_total_size_bytes: Option<u64>,
}

/// Full dispatch descriptor sent to a task-runtime, field-for-field per
/// spec §6.2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJobRequest {
    pub run_id: Uuid,
    pub repository_id: Uuid,
    pub task_id: Uuid,
    pub harness_type: String,
    pub image_tag: String,
    pub clone_url: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub working_directory: Option<String>,
    pub instruction: String,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub concurrency_key: Option<String>,
    pub timeout_seconds: u32,
    pub retry_count: u32,
    pub artifact_patterns: Vec<String>,
    pub linked_failure_runs: Vec<Uuid>,
    pub custom_args: Option<Vec<String>>,
    pub dispatched_at: DateTime<Utc>,
    pub container_labels: HashMap<String, String>,
    pub attempt: u32,
    pub sandbox_profile: SandboxProfile,
    pub artifact_policy: ArtifactPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJobResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopJobResponse {
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillContainerResponse {
    pub success: bool,
    pub error_message: Option<String>,
    pub was_running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileOrphanedContainersResponse {
    pub success: bool,
    pub reconciled_count: u32,
    pub container_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessTool {
    pub command: String,
    pub display_name: String,
    pub status: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetHarnessToolsResponse {
    pub tools: Vec<HarnessTool>,
    pub checked_at: DateTime<Utc>,
}

/// Adapter interface to a task-runtime's wire protocol.
///
/// Implementors translate these calls into whatever transport the runtime
/// actually speaks (gRPC, HTTP, a local in-process channel for tests). The
/// trait is intentionally object-safe so it can be stored as
/// `Arc<dyn RuntimeGateway>`.
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Dispatch a run to a specific runtime.
    async fn dispatch_job(
        &self,
        runtime_id: Uuid,
        request: DispatchJobRequest,
    ) -> anyhow::Result<DispatchJobResponse>;

    /// Request a graceful stop of a running job.
    async fn stop_job(&self, runtime_id: Uuid, run_id: Uuid) -> anyhow::Result<StopJobResponse>;

    /// Force-kill a container, used when a graceful stop does not complete
    /// within the grace window.
    async fn kill_container(
        &self,
        runtime_id: Uuid,
        container_id: &str,
    ) -> anyhow::Result<KillContainerResponse>;

    /// Accept a heartbeat payload from a runtime.
    async fn heartbeat(
        &self,
        runtime_id: Uuid,
        host_name: &str,
        active_slots: i32,
        max_slots: i32,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<HeartbeatResponse>;

    /// Ask a runtime to reconcile any containers not tied to a live run.
    async fn reconcile_orphaned_containers(
        &self,
        runtime_id: Uuid,
    ) -> anyhow::Result<ReconcileOrphanedContainersResponse>;

    /// Query the harness tools available inside a runtime.
    async fn get_harness_tools(
        &self,
        runtime_id: Uuid,
        request_id: Uuid,
    ) -> anyhow::Result<GetHarnessToolsResponse>;
}

// Compile-time assertion: RuntimeGateway must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn RuntimeGateway) {}
};

/// In-process reference implementation used by tests and the `LocalGateway`
/// demo: every call succeeds immediately without touching a real container
/// driver.
#[derive(Default)]
pub struct LocalGateway {
    dispatched: Mutex<HashMap<Uuid, DispatchJobRequest>>,
}

impl LocalGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Test helper: inspect what was dispatched for a run.
    pub fn dispatched_request(&self, run_id: Uuid) -> Option<DispatchJobRequest> {
        self.dispatched.lock().unwrap().get(&run_id).cloned()
    }
}

#[async_trait]
impl RuntimeGateway for LocalGateway {
    async fn dispatch_job(
        &self,
        _runtime_id: Uuid,
        request: DispatchJobRequest,
    ) -> anyhow::Result<DispatchJobResponse> {
        let dispatched_at = request.dispatched_at;
        self.dispatched.lock().unwrap().insert(request.run_id, request);
        Ok(DispatchJobResponse {
            success: true,
            error_message: None,
            dispatched_at,
        })
    }

    async fn stop_job(&self, _runtime_id: Uuid, _run_id: Uuid) -> anyhow::Result<StopJobResponse> {
        Ok(StopJobResponse {
            success: true,
            error_message: None,
        })
    }

    async fn kill_container(
        &self,
        _runtime_id: Uuid,
        _container_id: &str,
    ) -> anyhow::Result<KillContainerResponse> {
        Ok(KillContainerResponse {
            success: true,
            error_message: None,
            was_running: true,
        })
    }

    async fn heartbeat(
        &self,
        _runtime_id: Uuid,
        _host_name: &str,
        _active_slots: i32,
        _max_slots: i32,
        _timestamp: DateTime<Utc>,
    ) -> anyhow::Result<HeartbeatResponse> {
        Ok(HeartbeatResponse { success: true })
    }

    async fn reconcile_orphaned_containers(
        &self,
        _runtime_id: Uuid,
    ) -> anyhow::Result<ReconcileOrphanedContainersResponse> {
        Ok(ReconcileOrphanedContainersResponse {
            success: true,
            reconciled_count: 0,
            container_ids: Vec::new(),
        })
    }

    async fn get_harness_tools(
        &self,
        _runtime_id: Uuid,
        _request_id: Uuid,
    ) -> anyhow::Result<GetHarnessToolsResponse> {
        Ok(GetHarnessToolsResponse {
            tools: Vec::new(),
            checked_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(run_id: Uuid) -> DispatchJobRequest {
        DispatchJobRequest {
            run_id,
            repository_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            harness_type: "claude-code".to_string(),
            image_tag: "fleetd/task-runtime:latest".to_string(),
            clone_url: "https://example.com/repo.git".to_string(),
            branch: None,
            commit_sha: None,
            working_directory: None,
            instruction: "fix the bug".to_string(),
            env: HashMap::new(),
            secrets: HashMap::new(),
            concurrency_key: None,
            timeout_seconds: 600,
            retry_count: 0,
            artifact_patterns: Vec::new(),
            linked_failure_runs: Vec::new(),
            custom_args: None,
            dispatched_at: Utc::now(),
            container_labels: HashMap::new(),
            attempt: 1,
            sandbox_profile: SandboxProfile::default(),
            artifact_policy: ArtifactPolicy::default(),
        }
    }

    #[test]
    fn runtime_gateway_is_object_safe() {
        let gateway: Arc<dyn RuntimeGateway> = LocalGateway::shared();
        let _ = gateway;
    }

    #[tokio::test]
    async fn local_gateway_records_dispatched_request() {
        let gateway = LocalGateway::new();
        let run_id = Uuid::new_v4();
        let request = sample_request(run_id);

        let response = gateway.dispatch_job(Uuid::new_v4(), request).await.unwrap();
        assert!(response.success);

        let recorded = gateway.dispatched_request(run_id).expect("should be recorded");
        assert_eq!(recorded.run_id, run_id);
    }

    #[tokio::test]
    async fn local_gateway_stop_and_kill_succeed() {
        let gateway = LocalGateway::new();
        let runtime_id = Uuid::new_v4();

        let stop = gateway.stop_job(runtime_id, Uuid::new_v4()).await.unwrap();
        assert!(stop.success);

        let kill = gateway
            .kill_container(runtime_id, "container-abc")
            .await
            .unwrap();
        assert!(kill.success);
        assert!(kill.was_running);
    }
}
