use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tracing::error;

use super::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/hubs", get(list_hubs))
        .route("/sensors", get(list_sensors))
}

async fn list_hubs(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    match state.ingestor.store().list_hubs().await {
        Ok(hubs) => (StatusCode::OK, Json(hubs)).into_response(),
        Err(e) => {
            error!("Failed to list hubs: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Failed to list hubs")).into_response()
        }
    }
}

async fn list_sensors(State(state): State<AppState>) -> impl IntoResponse {
    // ---
    match state.ingestor.store().list_sensors().await {
        Ok(sensors) => (StatusCode::OK, Json(sensors)).into_response(),
        Err(e) => {
            error!("Failed to list sensors: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json("Failed to list sensors")).into_response()
        }
    }
}
