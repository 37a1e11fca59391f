use serde::{Deserialize, Serialize};
use ts_rs::TS;

// --- FSM Types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum SessionState {
    #[default]
    Offline,
    /// Registered in the presence pool.
    Online,
    /// A match request is in flight.
    MatchPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    RequestMatch,
    MatchSettled,
    End,
    ConnectionLost,
}

// --- FSM Implementation ---

impl SessionState {
    pub fn on_event(self, event: Transition) -> SessionState {
        match (self, event) {
            (_, Transition::End) | (_, Transition::ConnectionLost) => SessionState::Offline,

            (SessionState::Offline, Transition::Start) => SessionState::Online,
            // Re-joining while online refreshes the registration.
            (SessionState::Online, Transition::Start) => SessionState::Online,

            (SessionState::Online, Transition::RequestMatch) => SessionState::MatchPending,
            (SessionState::MatchPending, Transition::MatchSettled) => SessionState::Online,

            // Default: remain in current state
            (state, _) => state,
        }
    }

    pub fn is_online(&self) -> bool {
        !matches!(self, SessionState::Offline)
    }

    pub fn is_match_pending(&self) -> bool {
        matches!(self, SessionState::MatchPending)
    }
}
