//! Read-only HTTP query layer plus the two administrative commands.
//!
//! Every handler is a single call into the store, the scheduler or the
//! broker status channel.

use std::sync::Arc;

use axum::Router;
use tokio::sync::watch;

use crate::broker::ConnectionState;
use crate::pipeline::Ingestor;

mod admin;
mod health;
mod identities;
mod readings;

// ---

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub ingestor: Arc<Ingestor>,
    pub link: watch::Receiver<ConnectionState>,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(identities::router())
        .merge(admin::router())
        .merge(health::router())
        .with_state(state)
}
