//! Administrative commands: sampling mode switch and storage reset.

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::AppState;
use crate::scheduler::SamplingMode;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/admin/mode", put(set_mode))
        .route("/admin/reset", post(reset))
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: SamplingMode,
}

#[derive(Debug, Serialize)]
struct ModeResponse {
    previous: SamplingMode,
    mode: SamplingMode,
    interval_secs: u64,
}

/// Handle `PUT /admin/mode` with `{"mode": "testing" | "normal"}`.
async fn set_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Json<ModeResponse> {
    // ---
    let scheduler = state.ingestor.scheduler();
    let previous = scheduler.set_mode(request.mode);
    info!("PUT /admin/mode - {} -> {}", previous, request.mode);

    Json(ModeResponse {
        previous,
        mode: request.mode,
        interval_secs: scheduler.intervals().for_mode(request.mode),
    })
}

/// Handle `POST /admin/reset`: drop and recreate storage.
async fn reset(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    match state.ingestor.reset_storage().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Storage reset failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Storage reset failed")).into_response()
        }
    }
}
