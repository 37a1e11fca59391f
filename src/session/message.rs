use axum::extract::ws::Utf8Bytes;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::{SessionError, SessionOutcome};
use crate::pool::ParticipantId;

/// Messages a participant sends over its WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    /// Re-register in the pool and immediately look for a peer.
    Join,
    /// Look for a peer without re-registering.
    RequestMatch,
    /// Leave the pool. The server replies `Left` and closes the connection.
    Leave,
}

/// Messages the server pushes to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    Welcome {
        participant_id: ParticipantId,
    },
    Matched {
        peer_id: ParticipantId,
    },
    /// Nobody else is waiting right now; asking again is fine.
    NoPeerAvailable,
    /// Another participant drew this one as its match.
    ChosenBy {
        peer_id: ParticipantId,
    },
    MatchFailed {
        reason: String,
        retryable: bool,
    },
    Left,
}

impl ServerMessage {
    pub fn from_outcome(outcome: SessionOutcome) -> Self {
        match outcome {
            SessionOutcome::Matched(peer_id) => ServerMessage::Matched { peer_id },
            SessionOutcome::NoPeerAvailable => ServerMessage::NoPeerAvailable,
        }
    }

    pub fn from_error(error: &SessionError) -> Self {
        ServerMessage::MatchFailed {
            reason: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

impl TryFrom<ServerMessage> for Utf8Bytes {
    type Error = serde_json::Error;
    fn try_from(msg: ServerMessage) -> Result<Self, Self::Error> {
        serde_json::to_string(&msg).map(Utf8Bytes::from)
    }
}

impl TryFrom<Utf8Bytes> for ClientMessage {
    type Error = serde_json::Error;
    fn try_from(bytes: Utf8Bytes) -> Result<Self, Self::Error> {
        serde_json::from_str(bytes.as_str())
    }
}
