// src/routes/health.rs
//! Health endpoint for the ingestion service.
//!
//! Used by container orchestrators and operators to see whether the process
//! is up, whether the broker subscription is live, and how many messages went
//! where. It follows the same boundary pattern as the other route files:
//! handler and response type stay private, the gateway (`mod.rs`) only sees
//! the subrouter.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::broker::ConnectionState;
use crate::pipeline::StatsSnapshot;
use crate::scheduler::SamplingMode;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    broker: &'static str,
    link_state: ConnectionState,
    sampling_mode: SamplingMode,
    interval_secs: u64,
    stats: StatsSnapshot,
}

/// Handle `GET /health`.
///
/// Always answers 200 while the process runs; a lost broker link shows up as
/// `"status": "degraded"` and `"broker": "not connected"`. Does not touch the
/// database.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    // ---
    let link_state = *state.link.borrow();
    let connected = link_state.is_connected();
    let scheduler = state.ingestor.scheduler();
    let mode = scheduler.mode();

    Json(HealthResponse {
        status: if connected { "ok" } else { "degraded" },
        broker: if connected { "connected" } else { "not connected" },
        link_state,
        sampling_mode: mode,
        interval_secs: scheduler.intervals().for_mode(mode),
        stats: state.ingestor.stats().snapshot(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
