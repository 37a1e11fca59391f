use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::fsm::{SessionState, Transition};
use crate::pool::{ParticipantId, PresenceLease};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Pushed to a participant's subscribers by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `peer` drew this participant as its match and removed it from the pool.
    ChosenBy { peer: ParticipantId },
}

#[derive(Debug)]
pub struct SessionEntry {
    state: SessionState,
    lease: Option<PresenceLease>,
    // connection currently driving this session, if any
    connection: Option<u64>,
    events: broadcast::Sender<SessionEvent>,
    created_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: SessionState::Offline,
            lease: None,
            connection: None,
            events,
            created_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn apply(&mut self, event: Transition) -> SessionState {
        self.state = self.state.on_event(event);
        self.state
    }

    /// Installs the lease from a fresh join. The superseded one is released
    /// quietly since the store already re-armed the hook for the new epoch.
    pub fn replace_lease(&mut self, lease: PresenceLease) {
        if let Some(old) = self.lease.replace(lease) {
            old.release();
        }
    }

    /// Forgets the lease without signalling a disconnect, after the record
    /// was already removed from the pool.
    pub fn drop_registration(&mut self) {
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
    }

    /// Hands the session to a new connection; the previous one no longer owns it.
    pub fn attach(&mut self, connection: u64) {
        self.connection = Some(connection);
    }

    pub fn connection(&self) -> Option<u64> {
        self.connection
    }

    /// Tears the entry down after an explicit leave.
    pub fn release(mut self) {
        self.drop_registration();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn notify(&self, event: SessionEvent) {
        // No subscribers just means nobody is listening right now.
        let _ = self.events.send(event);
    }

    pub fn view(&self, id: &ParticipantId) -> SessionView {
        SessionView {
            participant_id: id.clone(),
            state: self.state,
            created_at: self.created_at,
            registered: self.lease.is_some(),
        }
    }
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub participant_id: ParticipantId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub registered: bool,
}
