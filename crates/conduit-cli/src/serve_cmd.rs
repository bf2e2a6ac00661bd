//! Operator REST surface: a thin `axum` router over the Orchestrator's
//! snapshot state. Routing logic itself lives in `conduit-core`; this module
//! is plumbing only.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use conduit_core::orchestrator::Orchestrator;
use conduit_core::registry::Registry;
use conduit_core::state_store::StateStore;

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

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
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
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub registry: Arc<Registry>,
    pub store: Arc<StateStore>,
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub agent_name: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub execution_id: Uuid,
    pub trace_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
    pub previous_status: conduit_db::models::ExecutionStatus,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/{name}", get(get_agent))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/submit", post(submit))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/plans/{task_id}", get(get_plan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("conduit serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("conduit serve shut down");
    Ok(())
}

/// First Ctrl+C requests a graceful shutdown; a second forces immediate exit.
async fn shutdown_signal() {
    let first = tokio::signal::ctrl_c();
    first.await.expect("failed to install Ctrl+C handler");
    tracing::info!("shutdown requested, press Ctrl+C again to force exit");
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::warn!("forcing immediate exit");
        std::process::exit(130);
    });
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index(State(state): State<AppState>) -> axum::response::Response {
    let agents = state.orchestrator.list_registrations().await;
    let rows = if agents.is_empty() {
        "<tr><td colspan=\"3\">No agents registered.</td></tr>".to_string()
    } else {
        agents
            .iter()
            .map(|r| {
                format!(
                    "<tr><td><a href=\"/api/agents/{name}\">{name}</a></td><td>{status}</td><td>{mode}</td></tr>",
                    name = r.descriptor.name,
                    status = r.status,
                    mode = r.descriptor.mode,
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let html = format!(
        "<!DOCTYPE html>\
<html><head><title>conduit</title></head><body>\
<h1>conduit</h1>\
<p><a href=\"/api/agents\">/api/agents</a> | <a href=\"/api/executions\">/api/executions</a></p>\
<table><tr><th>Agent</th><th>Status</th><th>Mode</th></tr>{rows}</table>\
</body></html>"
    );

    Html(html).into_response()
}

async fn list_agents(State(state): State<AppState>) -> impl IntoResponse {
    let agents = state.orchestrator.list_registrations().await;
    let summaries: Vec<_> = agents
        .iter()
        .map(|r| {
            serde_json::json!({
                "name": r.descriptor.name,
                "mode": r.descriptor.mode,
                "status": r.status,
                "restart_count": r.restart_count,
                "last_heartbeat": r.last_heartbeat,
                "active_executions": r.active_executions,
            })
        })
        .collect();
    Json(summaries)
}

async fn get_agent(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<axum::response::Response, AppError> {
    let registration = state
        .orchestrator
        .registration(&name)
        .await
        .ok_or_else(|| AppError::not_found(format!("agent {name} not registered")))?;

    let descriptor = redact_descriptor(&registration.descriptor);

    Ok(Json(serde_json::json!({
        "status": registration.status,
        "restart_count": registration.restart_count,
        "last_heartbeat": registration.last_heartbeat,
        "active_executions": registration.active_executions,
        "descriptor": descriptor,
    }))
    .into_response())
}

/// Serialize a descriptor with provider credentials stripped.
fn redact_descriptor(descriptor: &conduit_core::descriptor::AgentDescriptor) -> serde_json::Value {
    let mut value = serde_json::to_value(descriptor).unwrap_or(serde_json::Value::Null);
    if let Some(llm) = value.get_mut("llm").and_then(|v| v.as_object_mut()) {
        llm.insert("credentials".to_owned(), serde_json::json!("<redacted>"));
    }
    value
}

async fn list_executions(State(state): State<AppState>) -> Result<axum::response::Response, AppError> {
    let executions = state
        .store
        .list_recent_executions(100)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(executions).into_response())
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let record = state
        .store
        .get_execution(id)
        .await
        .map_err(|err| match err {
            conduit_core::state_store::StateStoreError::NotFound { .. } => {
                AppError::not_found(format!("execution {id} not found"))
            }
            other => AppError::internal(other),
        })?;
    Ok(Json(record).into_response())
}

async fn submit(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> Result<axum::response::Response, AppError> {
    let execution_id = state
        .orchestrator
        .submit(&req.agent_name, req.payload, None)
        .await
        .map_err(AppError::internal)?;

    let record = state
        .store
        .get_execution(execution_id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(SubmitResponse {
        execution_id,
        trace_id: record.trace_id,
        status: "QUEUED",
    })
    .into_response())
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let (cancelled, previous_status) = state
        .orchestrator
        .cancel(id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(CancelResponse {
        cancelled,
        previous_status,
    })
    .into_response())
}

async fn get_plan(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let plan = state
        .store
        .get_plan(task_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("plan {task_id} not found")))?;
    Ok(Json(plan).into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use conduit_core::bus::InMemoryDispatchBus;
    use conduit_core::orchestrator::{Orchestrator, OrchestratorConfig};
    use conduit_core::registry::Registry;
    use conduit_core::state_store::StateStore;
    use conduit_test_utils::{create_test_db, drop_test_db};

    use super::*;

    async fn build_test_state(pool: PgPool) -> AppState {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::load(tmp.path()).await.unwrap());
        let store = Arc::new(StateStore::new(Arc::new(pool.clone())));
        let bus: conduit_core::bus::SharedDispatchBus = Arc::new(InMemoryDispatchBus::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(pool),
            registry.clone(),
            bus,
            store.clone(),
            OrchestratorConfig::default(),
        ));
        AppState {
            orchestrator,
            registry,
            store,
        }
    }

    async fn send_request(state: AppState, uri: &str) -> axum::response::Response {
        let app = super::build_router(state);
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
    async fn index_returns_html() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let resp = send_request(state, "/").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/html"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn list_agents_empty() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let resp = send_request(state, "/api/agents").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_agent_not_found() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let resp = send_request(state, "/api/agents/missing").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn list_executions_empty() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let resp = send_request(state, "/api/executions").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json, serde_json::json!([]));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_execution_not_found() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let random_id = uuid::Uuid::new_v4();
        let resp = send_request(state, &format!("/api/executions/{random_id}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_plan_not_found() {
        let (pool, db_name) = create_test_db().await;
        let state = build_test_state(pool.clone()).await;

        let random_id = uuid::Uuid::new_v4();
        let resp = send_request(state, &format!("/api/plans/{random_id}")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
