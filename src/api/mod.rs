//! REST front end over the election facade.
//!
//! Routes:
//! - `GET /leader/elect/{resource}/{node}/{ttl}` with the TTL in milliseconds
//! - `GET /leader/get/{resource}`
//! - `GET /leader/release/{resource}/{node}`
//! - `GET /heartbeat`

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, Level};

use crate::election::LeaderElection;
use crate::error::ElectionError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderResponse {
    pub leader: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps facade errors onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ElectionError> for ApiError {
    fn from(e: ElectionError) -> Self {
        let status = match &e {
            ElectionError::NoQuorum { .. } => StatusCode::NOT_IMPLEMENTED,
            ElectionError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorResponse { error: self.message })).into_response()
    }
}

pub fn router(election: Arc<LeaderElection>) -> Router {
    Router::new()
        .route("/leader/elect/{resource}/{node}/{ttl}", get(elect_leader))
        .route("/leader/get/{resource}", get(get_leader))
        .route("/leader/release/{resource}/{node}", get(release_leader))
        .route("/heartbeat", get(heartbeat))
        .with_state(election)
}

async fn elect_leader(
    State(election): State<Arc<LeaderElection>>,
    Path((resource, node, ttl_ms)): Path<(String, String, u64)>,
) -> Result<Json<LeaderResponse>, ApiError> {
    let leader = election
        .elect(&resource, &node, Duration::from_millis(ttl_ms))
        .await?;
    Ok(Json(LeaderResponse { leader }))
}

async fn get_leader(
    State(election): State<Arc<LeaderElection>>,
    Path(resource): Path<String>,
) -> Result<Json<LeaderResponse>, ApiError> {
    match election.get_leader(&resource).await? {
        Some(leader) => Ok(Json(LeaderResponse { leader })),
        None => Err(ApiError::not_found(format!("no leader of {}", resource))),
    }
}

async fn release_leader(
    State(election): State<Arc<LeaderElection>>,
    Path((resource, node)): Path<(String, String)>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let released = election.release(&resource, &node).await?;
    Ok(Json(ReleaseResponse { released }))
}

async fn heartbeat() -> &'static str {
    "OK"
}

/// Serve the API on `bind_addr` until Ctrl-C.
pub async fn serve(election: Arc<LeaderElection>, bind_addr: &str) -> Result<(), ElectionError> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| ElectionError::config(format!("invalid bind address '{}': {}", bind_addr, e)))?;

    let app = router(election).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let listener = TcpListener::bind(addr).await?;
    info!("Leader election API listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Leader election API stopped");
    Ok(())
}
