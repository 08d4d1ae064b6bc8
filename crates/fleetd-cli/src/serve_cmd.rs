//! `fleetd serve` -- the HTTP API plus the background loops that actually
//! make the orchestration core tick: scheduler admission/dispatch,
//! completion handling, runtime-pool maintenance, and dead-run sweeps.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use fleetd_core::scheduler::RunFilter;
use fleetd_db::queries::runs;

use crate::config::FleetdConfig;
use crate::core_ctx::{self, CoreHandles};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }

    fn from_core(err: fleetd_core::error::CoreError) -> Self {
        use fleetd_core::error::ErrorKind;
        let status = match err.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::PreconditionFailed => StatusCode::CONFLICT,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::RateLimited | ErrorKind::ResourceExhausted => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    task_id: Uuid,
    concurrency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CancelRunRequest {
    #[serde(default = "default_grace_seconds")]
    grace_seconds: u64,
}

fn default_grace_seconds() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    task_id: Option<Uuid>,
    repository_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
struct BacklogQuery {
    after_delivery_id: Option<i64>,
    max_events: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreateRunResponse {
    run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(core: CoreHandles) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/runs", post(create_run).get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/retry", post(retry_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runtimes", get(list_runtimes))
        .route("/api/runtimes/{id}", get(get_runtime))
        .route("/api/runtimes/{id}/recycle", post(recycle_runtime))
        .route(
            "/api/runtimes/{id}/quarantine-clear",
            post(clear_runtime_quarantine),
        )
        .route("/api/background", get(list_background))
        .route("/api/background/{id}", get(get_background))
        .route("/api/events", get(read_event_backlog))
        .layer(CorsLayer::permissive())
        .with_state(core)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, resolved: &FleetdConfig) -> Result<()> {
    let core = core_ctx::build(pool, &resolved.core);
    let shutdown = tokio_util::sync::CancellationToken::new();

    let background_handle = spawn_background_loops(core.clone(), resolved.core.clone(), shutdown.clone());

    let app = build_router(core.clone());
    let addr: SocketAddr = format!("{}:{}", resolved.server_bind, resolved.server_port).parse()?;
    tracing::info!("fleetd serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    core.background.shutdown();
    background_handle.abort();

    tracing::info!("fleetd serve shut down");
    Ok(())
}

async fn shutdown_signal(token: tokio_util::sync::CancellationToken) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
    token.cancel();
}

/// Spawn the periodic loops that drive the core forward: scheduler
/// admission/dispatch ticks, the completion listener, runtime-pool
/// maintenance, and dead-run sweeps. Each loop stops as soon as the
/// cancellation token fires.
fn spawn_background_loops(
    core: CoreHandles,
    config: fleetd_core::config::CoreConfig,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    core.scheduler.spawn_completion_listener();

    let scheduler_interval = Duration::from_secs(config.scheduler.scheduler_interval_seconds as u64);
    let dead_run_interval = Duration::from_secs(config.dead_run_detection.check_interval_seconds as u64);
    let heartbeat_interval = chrono::Duration::seconds(config.scheduler.scheduler_interval_seconds as i64);

    tokio::spawn(async move {
        let mut scheduler_tick = tokio::time::interval(scheduler_interval);
        let mut pool_tick = tokio::time::interval(scheduler_interval);
        let mut dead_run_tick = tokio::time::interval(dead_run_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = scheduler_tick.tick() => {
                    if let Err(err) = core.scheduler.tick().await {
                        tracing::warn!(error = %err, "scheduler tick failed");
                    }
                }
                _ = pool_tick.tick() => {
                    if let Err(err) = core.runtime_pool.quarantine_stale_heartbeats(heartbeat_interval).await {
                        tracing::warn!(error = %err, "heartbeat quarantine sweep failed");
                    }
                    match runs::count_queued(&core.pool).await {
                        Ok(queued) => {
                            if let Err(err) = core.runtime_pool.evaluate_pressure_scale_out(queued).await {
                                tracing::warn!(error = %err, "pressure scale-out evaluation failed");
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "failed to count queued runs"),
                    }
                    if let Err(err) = core.runtime_pool.scale_in_idle().await {
                        tracing::warn!(error = %err, "idle scale-in sweep failed");
                    }
                    if let Err(err) = core.runtime_pool.reconcile_orphans().await {
                        tracing::warn!(error = %err, "orphan reconciliation failed");
                    }
                }
                _ = dead_run_tick.tick() => {
                    match core.dead_run_detector.run_once().await {
                        Ok(report) => tracing::debug!(?report, "dead-run sweep complete"),
                        Err(err) => tracing::warn!(error = %err, "dead-run sweep failed"),
                    }
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    axum::response::Html(
        "<!DOCTYPE html><html><head><title>fleetd</title></head><body>\
<h1>fleetd</h1>\
<p><a href=\"/api/runs\">/api/runs</a> | <a href=\"/api/runtimes\">/api/runtimes</a> | \
<a href=\"/api/background\">/api/background</a> | <a href=\"/api/events\">/api/events</a></p>\
</body></html>",
    )
}

async fn create_run(
    State(core): State<CoreHandles>,
    Json(req): Json<CreateRunRequest>,
) -> Result<axum::response::Response, AppError> {
    let run_id = core
        .scheduler
        .create_run(req.task_id, req.concurrency_key.as_deref())
        .await
        .map_err(AppError::from_core)?;

    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })).into_response())
}

async fn list_runs(
    State(core): State<CoreHandles>,
    Query(query): Query<ListRunsQuery>,
) -> Result<axum::response::Response, AppError> {
    let runs = core
        .scheduler
        .list_runs(RunFilter {
            task_id: query.task_id,
            repository_id: query.repository_id,
        })
        .await
        .map_err(AppError::from_core)?;

    Ok(Json(runs).into_response())
}

async fn get_run(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let run = core.scheduler.get_run(id).await.map_err(AppError::from_core)?;
    Ok(Json(run).into_response())
}

async fn retry_run(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let run_id = core.scheduler.retry_run(id).await.map_err(AppError::from_core)?;
    Ok((StatusCode::CREATED, Json(CreateRunResponse { run_id })).into_response())
}

async fn cancel_run(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelRunRequest>>,
) -> Result<axum::response::Response, AppError> {
    let grace_seconds = body.map(|Json(b)| b.grace_seconds).unwrap_or_else(default_grace_seconds);
    core.scheduler
        .cancel_run(id, Duration::from_secs(grace_seconds))
        .await
        .map_err(AppError::from_core)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_runtimes(State(core): State<CoreHandles>) -> Result<axum::response::Response, AppError> {
    let runtimes = core.runtime_pool.list().await.map_err(AppError::from_core)?;
    Ok(Json(runtimes).into_response())
}

async fn get_runtime(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let runtime = core.runtime_pool.get(id).await.map_err(AppError::from_core)?;
    Ok(Json(runtime).into_response())
}

async fn recycle_runtime(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    core.runtime_pool.recycle_runtime(id).await.map_err(AppError::from_core)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn clear_runtime_quarantine(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    core.runtime_pool
        .clear_quarantine(id)
        .await
        .map_err(AppError::from_core)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_background(State(core): State<CoreHandles>) -> Result<axum::response::Response, AppError> {
    let items = core.background.snapshot().await.map_err(AppError::from_core)?;
    Ok(Json(items).into_response())
}

async fn get_background(
    State(core): State<CoreHandles>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let item = core
        .background
        .try_get(id)
        .await
        .map_err(AppError::from_core)?
        .ok_or_else(|| AppError::not_found(format!("background work {id} not found")))?;
    Ok(Json(item).into_response())
}

async fn read_event_backlog(
    State(core): State<CoreHandles>,
    Query(query): Query<BacklogQuery>,
) -> Result<axum::response::Response, AppError> {
    let page = core
        .event_bus
        .read_backlog(query.after_delivery_id.unwrap_or(0), query.max_events.unwrap_or(100))
        .await
        .map_err(AppError::from_core)?;
    Ok(Json(page).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use fleetd_db::queries::{repositories, tasks};
    use fleetd_test_utils::{create_test_db, drop_test_db};

    use super::*;

    async fn send_request(core: CoreHandles, uri: &str) -> axum::response::Response {
        let app = super::build_router(core);
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_index_returns_html() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let resp = send_request(core, "/").await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_runs_empty() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let resp = send_request(core, "/api/runs").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let repo = repositories::insert_repository(&pool, "repo", "git://x", "main", None)
            .await
            .unwrap();
        let task = tasks::insert_task(
            &pool,
            repo.id,
            "task",
            "claude-code",
            None,
            3,
            30,
            2.0,
            &serde_json::json!({}),
            &serde_json::json!({}),
            None,
            None,
        )
        .await
        .unwrap();

        let app = super::build_router(core.clone());
        let body = serde_json::json!({ "task_id": task.id }).to_string();
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        let run_id = json["run_id"].as_str().unwrap();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["state"], "queued");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_get_run_not_found() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let random_id = Uuid::new_v4();
        let resp = send_request(core, &format!("/api/runs/{random_id}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_runtimes_empty() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let resp = send_request(core, "/api/runtimes").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_list_background_empty() {
        let (pool, db_name) = create_test_db().await;
        let core = core_ctx::build(pool.clone(), &fleetd_core::config::CoreConfig::default());

        let resp = send_request(core, "/api/background").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
