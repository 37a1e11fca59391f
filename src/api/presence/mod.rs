use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{
    api::ErrorResponse,
    pool::{ParticipantId, PresenceRecord, PresenceStore},
    server::AppState,
    session::SessionError,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceResponse {
    pub participants: Vec<PresenceRecord>,
}

/// GET /api/presence
/// Everyone currently in the pool
pub async fn list_presence<S: PresenceStore>(
    State(state): State<AppState<S>>,
) -> impl IntoResponse {
    match state.controller.store().snapshot().await {
        Ok(pool) => Json(PresenceResponse {
            participants: pool.into_values().collect(),
        })
        .into_response(),
        Err(e) => SessionError::from(e).into_response(),
    }
}

/// GET /api/presence/:participant_id
pub async fn get_presence<S: PresenceStore>(
    State(state): State<AppState<S>>,
    Path(participant_id): Path<String>,
) -> impl IntoResponse {
    let id = ParticipantId::from(participant_id);
    match state.controller.store().snapshot().await {
        Ok(mut pool) => match pool.remove(&id) {
            Some(record) => Json(record).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new(
                    "ParticipantNotFound",
                    &format!("Participant '{id}' is not in the pool"),
                )),
            )
                .into_response(),
        },
        Err(e) => SessionError::from(e).into_response(),
    }
}

/// DELETE /api/presence/:participant_id
/// Evict a participant, ending its session
pub async fn evict_participant<S: PresenceStore>(
    State(state): State<AppState<S>>,
    Path(participant_id): Path<String>,
) -> impl IntoResponse {
    let id = ParticipantId::from(participant_id);
    match state.controller.end_session(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "success": true })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
