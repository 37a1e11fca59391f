use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{api::ErrorResponse, pool::{ParticipantId, StoreError}};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Presence store error: {0}")]
    Store(#[from] StoreError),
    #[error("Participant '{0}' has no active session")]
    NotOnline(ParticipantId),
    #[error("Participant '{0}' already has a match request in flight")]
    MatchInProgress(ParticipantId),
}

impl SessionError {
    /// Whether the caller may simply try the same operation again.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::Store(e) => e.is_retryable(),
            SessionError::NotOnline(_) => false,
            SessionError::MatchInProgress(_) => true,
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SessionError::Store(StoreError::ConnectionLost))
    }

    fn kind(&self) -> &'static str {
        match self {
            SessionError::Store(StoreError::ConnectionLost) => "ConnectionLost",
            SessionError::Store(StoreError::Conflict) => "Conflict",
            SessionError::Store(StoreError::RetryExhausted { .. }) => "RetryExhausted",
            SessionError::NotOnline(_) => "NotOnline",
            SessionError::MatchInProgress(_) => "MatchInProgress",
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::Store(StoreError::ConnectionLost) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Store(_) | SessionError::MatchInProgress(_) => StatusCode::CONFLICT,
            SessionError::NotOnline(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(ErrorResponse::new(self.kind(), &self.to_string()))).into_response()
    }
}
