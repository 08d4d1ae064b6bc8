//! Static configuration for every core component, covering each key in
//! the orchestration core's configuration surface. The CLI/API layer is
//! responsible for resolving these values from flags/env/file/default and
//! handing over a fully-populated [`CoreConfig`]; this module only owns the
//! shape and the validation rules.

use serde::{Deserialize, Serialize};

/// Top-level configuration bundle threaded through the scheduler, pool,
/// event bus, background coordinator, and dead-run detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub retry_defaults: RetryDefaults,
    pub ttl_days: TtlConfig,
    pub dead_run_detection: DeadRunDetectionConfig,
    pub stage_timeout: StageTimeoutConfig,
    pub task_runtimes: RuntimePoolConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            retry_defaults: RetryDefaults::default(),
            ttl_days: TtlConfig::default(),
            dead_run_detection: DeadRunDetectionConfig::default(),
            stage_timeout: StageTimeoutConfig::default(),
            task_runtimes: RuntimePoolConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Cross-field validation that can't be expressed as a single field
    /// default. Rejects configurations that would violate a spec-level
    /// boundary behavior (e.g. a per-repo cap looser than the per-project
    /// cap it nests under).
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler.validate()?;
        self.task_runtimes.validate()?;
        Ok(())
    }
}

/// Scheduler admission and tick configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scheduler_interval_seconds: u32,
    pub max_global_concurrent_runs: u32,
    pub per_project_concurrency_limit: Option<u32>,
    pub per_repo_concurrency_limit: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_seconds: 10,
            max_global_concurrent_runs: 50,
            per_project_concurrency_limit: None,
            per_repo_concurrency_limit: None,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=300).contains(&self.scheduler_interval_seconds) {
            return Err(format!(
                "schedulerIntervalSeconds must be 1-300, got {}",
                self.scheduler_interval_seconds
            ));
        }
        if let (Some(per_repo), Some(per_project)) = (
            self.per_repo_concurrency_limit,
            self.per_project_concurrency_limit,
        ) {
            if per_repo > per_project {
                return Err(format!(
                    "perRepoConcurrencyLimit ({per_repo}) must not exceed perProjectConcurrencyLimit ({per_project})"
                ));
            }
        }
        if let Some(per_repo) = self.per_repo_concurrency_limit {
            if per_repo > self.max_global_concurrent_runs {
                return Err(format!(
                    "perRepoConcurrencyLimit ({per_repo}) must not exceed maxGlobalConcurrentRuns ({})",
                    self.max_global_concurrent_runs
                ));
            }
        }
        Ok(())
    }
}

/// Default retry policy applied to a run's `retryPolicy` snapshot when the
/// task does not override it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    pub max_attempts: u32,
    pub backoff_base_seconds: u32,
    pub backoff_multiplier: f64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_seconds: 30,
            backoff_multiplier: 2.0,
        }
    }
}

/// Retention windows for logs and runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub logs: u32,
    pub runs: u32,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            logs: 30,
            runs: 90,
        }
    }
}

/// Dead-run detector thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadRunDetectionConfig {
    pub check_interval_seconds: u32,
    pub stale_run_threshold_minutes: u32,
    pub zombie_run_threshold_minutes: u32,
    pub max_run_age_hours: u32,
    pub enable_auto_termination: bool,
    pub force_kill_on_timeout: bool,
}

impl Default for DeadRunDetectionConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 60,
            stale_run_threshold_minutes: 5,
            zombie_run_threshold_minutes: 15,
            max_run_age_hours: 24,
            enable_auto_termination: true,
            force_kill_on_timeout: true,
        }
    }
}

/// Workflow stage timeout caps. `PendingApproval` is the only stage the
/// scheduler itself models; the remaining fields are carried so the config
/// surface stays future-proof for a multi-stage workflow engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeoutConfig {
    pub default_task_stage_timeout_minutes: u32,
    pub default_approval_stage_timeout_hours: u32,
    pub default_parallel_stage_timeout_minutes: u32,
    pub max_stage_timeout_hours: u32,
}

impl Default for StageTimeoutConfig {
    fn default() -> Self {
        Self {
            default_task_stage_timeout_minutes: 30,
            default_approval_stage_timeout_hours: 24,
            default_parallel_stage_timeout_minutes: 60,
            max_stage_timeout_hours: 72,
        }
    }
}

/// Connectivity mode between the control plane and a task-runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityMode {
    AutoDetect,
    DockerDnsOnly,
    HostPortOnly,
}

impl Default for ConnectivityMode {
    fn default() -> Self {
        Self::AutoDetect
    }
}

/// RuntimePool sizing and pressure-scaling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePoolConfig {
    pub max_task_runtimes: u32,
    pub parallel_slots_per_task_runtime: u32,
    pub idle_timeout_minutes: u32,
    pub startup_timeout_seconds: u32,
    pub container_image: String,
    pub container_name_prefix: String,
    pub docker_network: Option<String>,
    pub connectivity_mode: ConnectivityMode,
    pub enable_pressure_scaling: bool,
    pub cpu_scale_out_threshold_percent: u32,
    pub memory_scale_out_threshold_percent: u32,
    pub pressure_sample_window_seconds: u32,
}

impl Default for RuntimePoolConfig {
    fn default() -> Self {
        Self {
            max_task_runtimes: 8,
            parallel_slots_per_task_runtime: 1,
            idle_timeout_minutes: 15,
            startup_timeout_seconds: 60,
            container_image: "fleetd/task-runtime:latest".to_string(),
            container_name_prefix: "fleetd-runtime-".to_string(),
            docker_network: None,
            connectivity_mode: ConnectivityMode::AutoDetect,
            enable_pressure_scaling: false,
            cpu_scale_out_threshold_percent: 80,
            memory_scale_out_threshold_percent: 80,
            pressure_sample_window_seconds: 60,
        }
    }
}

impl RuntimePoolConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=256).contains(&self.max_task_runtimes) {
            return Err(format!(
                "maxTaskRuntimes must be 1-256, got {}",
                self.max_task_runtimes
            ));
        }
        if !(1..=128).contains(&self.parallel_slots_per_task_runtime) {
            return Err(format!(
                "parallelSlotsPerTaskRuntime must be 1-128, got {}",
                self.parallel_slots_per_task_runtime
            ));
        }
        if !(1..=1440).contains(&self.idle_timeout_minutes) {
            return Err(format!(
                "idleTimeoutMinutes must be 1-1440, got {}",
                self.idle_timeout_minutes
            ));
        }
        if !(5..=300).contains(&self.startup_timeout_seconds) {
            return Err(format!(
                "startupTimeoutSeconds must be 5-300, got {}",
                self.startup_timeout_seconds
            ));
        }
        if !(1..=100).contains(&self.cpu_scale_out_threshold_percent) {
            return Err(format!(
                "cpuScaleOutThresholdPercent must be 1-100, got {}",
                self.cpu_scale_out_threshold_percent
            ));
        }
        if !(1..=100).contains(&self.memory_scale_out_threshold_percent) {
            return Err(format!(
                "memoryScaleOutThresholdPercent must be 1-100, got {}",
                self.memory_scale_out_threshold_percent
            ));
        }
        if !(5..=600).contains(&self.pressure_sample_window_seconds) {
            return Err(format!(
                "pressureSampleWindowSeconds must be 5-600, got {}",
                self.pressure_sample_window_seconds
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(CoreConfig::default().validate().is_ok());
    }

    #[test]
    fn per_repo_exceeding_per_project_is_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.per_project_concurrency_limit = Some(2);
        cfg.per_repo_concurrency_limit = Some(5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn scheduler_interval_out_of_range_is_rejected() {
        let mut cfg = SchedulerConfig::default();
        cfg.scheduler_interval_seconds = 0;
        assert!(cfg.validate().is_err());
        cfg.scheduler_interval_seconds = 301;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn runtime_pool_config_rejects_out_of_range_fields() {
        let mut cfg = RuntimePoolConfig::default();
        cfg.max_task_runtimes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimePoolConfig::default();
        cfg.startup_timeout_seconds = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let cfg = CoreConfig::default();
        let text = toml::to_string(&cfg).expect("serialize");
        let parsed: CoreConfig = toml::from_str(&text).expect("deserialize");
        assert_eq!(
            parsed.scheduler.max_global_concurrent_runs,
            cfg.scheduler.max_global_concurrent_runs
        );
    }
}
