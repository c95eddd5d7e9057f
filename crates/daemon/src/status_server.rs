//! Status HTTP Server for restream
//!
//! Exposes live stream status and a minimal start/stop control surface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineError};
use crate::registry::LiveStatus;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub active_streams: usize,
    pub shutting_down: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamsResponse {
    pub active: Vec<String>,
    pub streams: Vec<LiveStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub stream_id: String,
    pub action: String,
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Engine errors rendered as JSON responses
struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

/// HTTP status for an engine error.
pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning(_) | EngineError::NotRunning(_) => StatusCode::CONFLICT,
        EngineError::EmptyPlaylist(_) | EngineError::Disabled(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        EngineError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Handler for GET /health
async fn get_health(State(engine): State<Engine>) -> Json<HealthResponse> {
    let shutting_down = engine.is_shutting_down();
    Json(HealthResponse {
        status: if shutting_down { "draining" } else { "ok" }.to_string(),
        active_streams: engine.registry().len(),
        shutting_down,
    })
}

/// Handler for GET /streams
async fn get_streams(State(engine): State<Engine>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        active: engine.active_stream_ids().into_iter().collect(),
        streams: engine.live_streams(),
    })
}

/// Handler for POST /streams/:id/start
async fn start_stream(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    engine.start_stream(&id).await?;
    Ok(Json(ActionResponse {
        stream_id: id,
        action: "started".to_string(),
    }))
}

/// Handler for POST /streams/:id/stop
async fn stop_stream(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> Result<Json<ActionResponse>, ApiError> {
    engine.stop_stream(&id).await?;
    Ok(Json(ActionResponse {
        stream_id: id,
        action: "stopped".to_string(),
    }))
}

/// Creates the axum Router for the status endpoints
pub fn create_status_router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/streams", get(get_streams))
        .route("/streams/:id/start", post(start_stream))
        .route("/streams/:id/stop", post(stop_stream))
        .with_state(engine)
}

/// Runs the status HTTP server on `bind` until `shutdown` is cancelled.
pub async fn run_status_server(
    engine: Engine,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_status_router(engine);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
