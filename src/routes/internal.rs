use axum::{extract::State, response::IntoResponse};

use crate::{AppState, gatekeeper::GuardStats};

use super::success_to_api_response;

pub async fn guard_stats(State(state): State<AppState>) -> impl IntoResponse {
    success_to_api_response(GuardStats::collect(&state.admission, &state.cache))
}

pub async fn health() -> &'static str {
    "ok"
}
