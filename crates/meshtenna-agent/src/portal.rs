//! Status portal.
//!
//! GET  /api/status             - live session snapshot
//! GET  /api/results/antennas   - antenna table (`?location=&sort=&desc=`)
//! GET  /api/results/locations  - location table (`?sort=&desc=`)
//! POST /api/test/stop          - stop the running test

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use meshtenna_common::models::{AntennaScore, LocationScore};
use meshtenna_common::protocol::{SchedulerPhase, SessionStatus};

use crate::persistence::PersistenceQueue;
use crate::score::{ScoreEngine, SortKey, SortOrder};
use crate::storage::Storage;

/// State shared across all request handlers.
pub struct PortalState<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PortalState<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    status: watch::Receiver<SessionStatus>,
    stop: watch::Sender<bool>,
    scores: ScoreEngine<S>,
}

impl<S: Storage> PortalState<S> {
    pub fn new(
        status: watch::Receiver<SessionStatus>,
        stop: watch::Sender<bool>,
        persistence: PersistenceQueue<S>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                status,
                stop,
                scores: ScoreEngine::new(persistence),
            }),
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

/// Build the portal router.
pub fn router<S: Storage>(state: PortalState<S>) -> Router {
    Router::new()
        .route("/api/status", get(get_status::<S>))
        .route("/api/results/antennas", get(list_antennas::<S>))
        .route("/api/results/locations", get(list_locations::<S>))
        .route("/api/test/stop", post(stop_test::<S>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the portal until the listener fails.
pub async fn serve<S: Storage>(addr: SocketAddr, state: PortalState<S>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("status portal listening on {addr}");
    axum::serve(listener, router(state)).await
}

// ── Status ──────────────────────────────────────────────────────────

async fn get_status<S: Storage>(State(state): State<PortalState<S>>) -> Json<SessionStatus> {
    Json(state.inner.status.borrow().clone())
}

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ResultsQuery {
    pub location: Option<String>,
    pub sort: Option<String>,
    pub desc: Option<bool>,
}

impl ResultsQuery {
    fn order(&self) -> Result<SortOrder, ApiError> {
        let key = match self.sort.as_deref() {
            None | Some("") => SortKey::default(),
            Some(raw) => raw.parse().map_err(ApiError::bad_request)?,
        };
        Ok(SortOrder {
            key,
            descending: self.desc.unwrap_or(true),
        })
    }

    /// `All`, empty or absent means no location filter.
    fn location(&self) -> Option<&str> {
        self.location
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != "All")
    }
}

async fn list_antennas<S: Storage>(
    State(state): State<PortalState<S>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<AntennaScore>>, ApiError> {
    let order = query.order()?;
    let rows = state
        .inner
        .scores
        .antenna_scores(query.location(), order)
        .await;
    Ok(Json(rows))
}

async fn list_locations<S: Storage>(
    State(state): State<PortalState<S>>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Vec<LocationScore>>, ApiError> {
    let order = query.order()?;
    Ok(Json(state.inner.scores.location_scores(order).await))
}

// ── Control ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopping: bool,
}

async fn stop_test<S: Storage>(
    State(state): State<PortalState<S>>,
) -> Result<(StatusCode, Json<StopResponse>), ApiError> {
    let phase = state.inner.status.borrow().phase;
    if phase == SchedulerPhase::Idle {
        return Err(ApiError::conflict("no test running"));
    }

    state.inner.stop.send_replace(true);
    tracing::info!(?phase, "stop requested via portal");
    Ok((StatusCode::ACCEPTED, Json(StopResponse { stopping: true })))
}
