//! HTTP API of the master.
//!
//! - `POST /api/v1/report`: a node submits its latest measurement.
//! - `GET /api/v1/status`: the current aggregated report as JSON.
//! - `GET /health`: liveness check.
//!
//! Both `/api/v1` routes require `Authorization: Bearer <master.api_token>`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::master::MasterService;
use crate::model::{AggregatedReport, ReportPayload, SpeedtestResult};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub master: Arc<MasterService>,
    pub api_token: SecretString,
}

type ApiError = (StatusCode, &'static str);

const UNAUTHORIZED: ApiError = (StatusCode::UNAUTHORIZED, "Unauthorized");

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/report", post(post_report))
        .route("/api/v1/status", get(get_status))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// POST /api/v1/report - Accept a node measurement.
///
/// # Request Body
///
/// A [`ReportPayload`] as JSON.
///
/// # Response
///
/// - `200 OK` with body `OK` once the measurement is recorded.
/// - `401` on a missing or wrong bearer token.
/// - `400` on malformed JSON, missing fields or an empty `node_id`.
///
/// The receive time recorded for staleness is the master's clock, not the
/// payload's `timestamp`. An immediate publish, if configured, runs in the
/// background and does not delay the answer.
#[instrument(skip_all)]
pub async fn post_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReportPayload>, JsonRejection>,
) -> Result<&'static str, ApiError> {
    if !is_authorized(&headers, &state.api_token) {
        warn!("Rejected report with invalid bearer token");
        return Err(UNAUTHORIZED);
    }

    let Json(payload) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Rejected malformed report");
        (StatusCode::BAD_REQUEST, "Invalid report payload")
    })?;

    if payload.node_id.trim().is_empty() {
        warn!("Rejected report without node_id");
        return Err((StatusCode::BAD_REQUEST, "node_id must not be empty"));
    }

    let received_at = Utc::now();
    state
        .master
        .ingest(SpeedtestResult::from(payload), received_at);

    Ok("OK")
}

/// GET /api/v1/status - Current aggregated report.
#[instrument(skip_all)]
pub async fn get_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<AggregatedReport>, ApiError> {
    if !is_authorized(&headers, &state.api_token) {
        return Err(UNAUTHORIZED);
    }

    let report = state.master.build_report(Utc::now());
    info!(
        nodes = report.nodes.len(),
        offline = report.summary.offline,
        "Status queried"
    );
    Ok(Json(report))
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// True when the request carries `Bearer <token>` and a token is configured.
fn is_authorized(headers: &HeaderMap, token: &SecretString) -> bool {
    let expected = token.expose_secret();
    if expected.is_empty() {
        return false;
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|given| given.trim() == expected)
}
