pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use crate::api::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/flows/{id}/run", post(handlers::run_flow))
        .route("/flows/{id}/stop", post(handlers::stop_flow))
        .route("/flows/{id}/recover", post(handlers::recover_flow))
        .route("/flows/{id}/state", get(handlers::get_state))
        .route("/flows/{id}/state/live", get(handlers::stream_state))
}
