//! Wires the five orchestration-core components together from a pool and a
//! resolved [`CoreConfig`]. Every command handler that needs more than a bare
//! query goes through this to avoid repeating the construction order.

use std::sync::Arc;

use fleetd_core::background::BackgroundWorkCoordinator;
use fleetd_core::clock::{Clock, IdGen, SystemClock, UuidGen};
use fleetd_core::config::CoreConfig;
use fleetd_core::deadrun::DeadRunDetector;
use fleetd_core::events::EventBus;
use fleetd_core::gateway::LocalGateway;
use fleetd_core::pool::RuntimePool;
use fleetd_core::scheduler::Scheduler;
use sqlx::PgPool;

/// Every long-lived handle a command or the server might need. Built once
/// per process invocation; cheap to clone since each field is already an
/// `Arc`.
#[derive(Clone)]
pub struct CoreHandles {
    pub pool: PgPool,
    pub scheduler: Arc<Scheduler>,
    pub runtime_pool: Arc<RuntimePool>,
    pub event_bus: Arc<EventBus>,
    pub background: Arc<BackgroundWorkCoordinator>,
    pub dead_run_detector: Arc<DeadRunDetector>,
    pub gateway: Arc<LocalGateway>,
}

/// Construct the component graph in dependency order: gateway, then pool
/// (needs the gateway to dispatch/stop/heartbeat), then the event bus, then
/// the scheduler and dead-run detector (both need pool, gateway, event bus).
pub fn build(pool: PgPool, config: &CoreConfig) -> CoreHandles {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let idgen: Arc<dyn IdGen> = Arc::new(UuidGen);
    let gateway = LocalGateway::shared();

    let runtime_pool = Arc::new(RuntimePool::new(
        pool.clone(),
        gateway.clone(),
        config.task_runtimes.clone(),
        clock.clone(),
    ));
    let event_bus = Arc::new(EventBus::new(pool.clone()));
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        runtime_pool.clone(),
        gateway.clone(),
        event_bus.clone(),
        config.scheduler.clone(),
        config.retry_defaults,
        clock.clone(),
        idgen,
    ));
    let dead_run_detector = Arc::new(DeadRunDetector::new(
        pool.clone(),
        gateway.clone(),
        runtime_pool.clone(),
        event_bus.clone(),
        config.dead_run_detection,
        clock,
    ));
    let background = BackgroundWorkCoordinator::with_defaults(pool.clone());

    CoreHandles {
        pool,
        scheduler,
        runtime_pool,
        event_bus,
        background,
        dead_run_detector,
        gateway,
    }
}
