use axum::{Json, extract::State, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::{pool::PresenceStore, server::AppState, session::SessionError};

pub mod presence;
pub mod sessions;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub pool_size: usize,
    pub sessions: usize,
}

/// GET /healthz
pub async fn health<S: PresenceStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    match state.controller.store().snapshot().await {
        Ok(pool) => Json(HealthResponse {
            status: "ok".to_string(),
            pool_size: pool.len(),
            sessions: state.controller.sessions().await.len(),
        })
        .into_response(),
        Err(e) => SessionError::from(e).into_response(),
    }
}
