use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, error};

use super::AppState;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/readings", get(handler))
}

/// Query parameters for `GET /readings`.
///
/// `from`/`to` are RFC 3339 timestamps, both inclusive. Missing `from` means
/// the epoch; missing `to` means one day past now.
#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    hub_id: String,
    sensor_id: String,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn handler(
    Query(params): Query<ReadingsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // ---
    debug!("GET /readings - {:?}", params);

    let from = params.from.unwrap_or(DateTime::UNIX_EPOCH);
    let to = params.to.unwrap_or_else(|| Utc::now() + Duration::days(1));
    if from > to {
        return (
            StatusCode::BAD_REQUEST,
            Json("'from' must not be after 'to'"),
        )
            .into_response();
    }

    match state
        .ingestor
        .store()
        .query_range(&params.hub_id, &params.sensor_id, from, to)
        .await
    {
        Ok(readings) => {
            debug!("GET /readings - returning {} readings", readings.len());
            (StatusCode::OK, Json(readings)).into_response()
        }
        Err(e) => {
            error!("Failed to query readings: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json("Failed to query readings"),
            )
                .into_response()
        }
    }
}
