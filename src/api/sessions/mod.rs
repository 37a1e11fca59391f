use axum::{Json, extract::State, response::IntoResponse};

use crate::{pool::PresenceStore, server::AppState};

/// GET /api/sessions
/// Sessions hosted by this server and the state each is in
pub async fn list_sessions<S: PresenceStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    Json(state.controller.sessions().await)
}
