//! HTTP control plane.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/health` | GET | liveness |
//! | `/api/status` | GET | connection state, phase and statistics |
//! | `/api/nodes` | GET | filtered, sorted node list |
//! | `/api/export` | GET | JSON or CSV download of the same view |
//! | `/api/refresh` | POST | start a discovery pass |
//! | `/api/config/endpoint` | GET, PUT, DELETE | endpoint override |
//! | `/api/config/addresses` | GET, POST | custom polling addresses |
//! | `/api/config/addresses/{address}` | DELETE | remove a custom address |
//! | `/metrics` | GET | Prometheus text |
//! | `/ws` | GET | snapshot stream |

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

use crate::discovery::Node;
use crate::host::ScoutHostState;
use crate::infrastructure::config::ServerSettings;
use crate::orchestrator::{ConnectionState, OrchestratorError, Phase, Stats};
use crate::view::{self, ExportFormat, NodeQuery, ViewError};
use crate::ws::handler::ws_handler;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl From<ViewError> for ApiError {
    fn from(e: ViewError) -> Self {
        Self::BadRequest(e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::InvalidAddress(_) | OrchestratorError::EmptyEndpoint => {
                Self::BadRequest(e.to_string())
            }
            OrchestratorError::Preferences(_) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(msg) => {
                error!(error = %msg, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub cycle: u64,
    pub phase: Phase,
    pub connection: ConnectionState,
    pub source: Option<String>,
    pub error: Option<String>,
    pub reachable: Option<usize>,
    pub stats: Stats,
    pub discovering: bool,
    pub relay: bool,
    pub ws_clients: usize,
    pub updated_at: u64,
}

#[derive(Debug, Serialize)]
pub struct EndpointResponse {
    #[serde(rename = "override")]
    pub endpoint_override: Option<String>,
    pub active: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EndpointRequest {
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct AddressRequest {
    pub address: String,
}

pub fn router(state: Arc<ScoutHostState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/nodes", get(list_nodes))
        .route("/api/export", get(export_nodes))
        .route("/api/refresh", post(refresh))
        .route(
            "/api/config/endpoint",
            get(get_endpoint).put(put_endpoint).delete(clear_endpoint),
        )
        .route("/api/config/addresses", get(list_addresses).post(add_address))
        .route("/api/config/addresses/{address}", delete(remove_address))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

pub async fn run_server(
    settings: &ServerSettings,
    state: Arc<ScoutHostState>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Control plane listening");
    serve(listener, state, shutdown).await
}

/// Serves on an already bound listener until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ScoutHostState>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let stop = shutdown.notified_owned();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(stop)
        .await?;
    info!("Control plane stopped");
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<ScoutHostState>>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    let snapshot = orchestrator.snapshot();
    Json(StatusResponse {
        cycle: snapshot.cycle,
        phase: snapshot.phase,
        connection: snapshot.connection,
        source: snapshot.source,
        error: snapshot.error,
        reachable: snapshot.reachable,
        stats: snapshot.stats,
        discovering: orchestrator.is_discovering(),
        relay: orchestrator.relay_active(),
        ws_clients: state.broadcaster().client_count(),
        updated_at: snapshot.updated_at,
    })
}

fn filtered(state: &ScoutHostState, query: &NodeQuery) -> Result<Vec<Node>, ApiError> {
    let criteria = query.criteria()?;
    let sort = query.sort_spec()?;
    Ok(view::apply(&state.orchestrator.snapshot().nodes, &criteria, sort))
}

async fn list_nodes(
    State(state): State<Arc<ScoutHostState>>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<Vec<Node>>, ApiError> {
    Ok(Json(filtered(&state, &query)?))
}

async fn export_nodes(
    State(state): State<Arc<ScoutHostState>>,
    Query(query): Query<NodeQuery>,
) -> Result<Response, ApiError> {
    let format = query.export_format()?;
    let nodes = filtered(&state, &query)?;
    let (body, content_type, file) = match format {
        ExportFormat::Json => (
            view::to_json(&nodes).map_err(|e| ApiError::Internal(e.to_string()))?,
            "application/json",
            "nodes.json",
        ),
        ExportFormat::Csv => (view::to_csv(&nodes), "text/csv; charset=utf-8", "nodes.csv"),
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file}\""),
            ),
        ],
        body,
    )
        .into_response())
}

async fn refresh(State(state): State<Arc<ScoutHostState>>) -> Result<impl IntoResponse, ApiError> {
    if state.orchestrator.trigger() {
        Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
    } else {
        Err(ApiError::Conflict("discovery already in progress".into()))
    }
}

fn endpoint_response(state: &ScoutHostState) -> EndpointResponse {
    let prefs = state.orchestrator.preferences();
    EndpointResponse {
        endpoint_override: prefs.endpoint_override,
        active: prefs.active_endpoint,
    }
}

async fn get_endpoint(State(state): State<Arc<ScoutHostState>>) -> Json<EndpointResponse> {
    Json(endpoint_response(&state))
}

async fn put_endpoint(
    State(state): State<Arc<ScoutHostState>>,
    Json(body): Json<EndpointRequest>,
) -> Result<Json<EndpointResponse>, ApiError> {
    state.orchestrator.set_endpoint_override(Some(body.endpoint))?;
    Ok(Json(endpoint_response(&state)))
}

async fn clear_endpoint(
    State(state): State<Arc<ScoutHostState>>,
) -> Result<Json<EndpointResponse>, ApiError> {
    state.orchestrator.set_endpoint_override(None)?;
    Ok(Json(endpoint_response(&state)))
}

async fn list_addresses(State(state): State<Arc<ScoutHostState>>) -> Json<Vec<String>> {
    Json(state.orchestrator.preferences().custom_addresses)
}

async fn add_address(
    State(state): State<Arc<ScoutHostState>>,
    Json(body): Json<AddressRequest>,
) -> Result<(StatusCode, Json<Vec<String>>), ApiError> {
    let added = state.orchestrator.add_custom_address(&body.address)?;
    let status = if added { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(state.orchestrator.preferences().custom_addresses)))
}

async fn remove_address(
    State(state): State<Arc<ScoutHostState>>,
    Path(address): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.orchestrator.remove_custom_address(&address)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("address '{address}' is not configured")))
    }
}

async fn metrics(State(state): State<Arc<ScoutHostState>>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or_else(|| ApiError::NotFound("metrics are disabled".into()))
}
