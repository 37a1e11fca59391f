pub mod entry;
pub mod error;
pub mod fsm;
pub mod message;

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};

pub use entry::{SessionEntry, SessionEvent, SessionView};
pub use error::SessionError;
pub use fsm::{SessionState, Transition};

use crate::pool::{
    MatchResult, MatchSelector, ParticipantId, PresenceStore, RecordStatus, StoreError, TxOutcome,
};

/// What a match request resolved to, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOutcome {
    Matched(ParticipantId),
    /// The pool had nobody to offer. Not a failure; retrying is fine.
    NoPeerAvailable,
}

/// Drives participants through join → match → leave against a presence store.
#[derive(Debug)]
pub struct SessionController<S: PresenceStore> {
    store: Arc<S>,
    selector: MatchSelector<S>,
    sessions: RwLock<HashMap<ParticipantId, SessionEntry>>,
    next_connection: AtomicU64,
}

impl<S: PresenceStore> SessionController<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            selector: MatchSelector::new(Arc::clone(&store)),
            store,
            sessions: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Registers `id` in the pool and asks for a match straight away.
    ///
    /// A lost store connection is fatal: the session is torn down before the
    /// error is returned.
    pub async fn start_session(&self, id: &ParticipantId) -> Result<SessionOutcome, SessionError> {
        let lease = match self.store.join(id).await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(participant_id = %id, error = %e, "Failed to join presence pool");
                if e == StoreError::ConnectionLost {
                    self.tear_down(id).await;
                }
                return Err(e.into());
            }
        };

        {
            let mut sessions = self.sessions.write().await;
            let entry = sessions.entry(id.clone()).or_default();
            entry.replace_lease(lease);
            entry.apply(Transition::Start);
        }
        tracing::info!(participant_id = %id, "Session started");

        self.request_match(id).await
    }

    /// Looks for a random available peer for `id`.
    pub async fn request_match(&self, id: &ParticipantId) -> Result<SessionOutcome, SessionError> {
        {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(id)
                .filter(|entry| entry.state().is_online())
                .ok_or_else(|| SessionError::NotOnline(id.clone()))?;
            if entry.state().is_match_pending() {
                return Err(SessionError::MatchInProgress(id.clone()));
            }
            entry.apply(Transition::RequestMatch);
        }

        let result = self.run_match(id).await;

        // end_session may have removed the entry meanwhile; settling is then a no-op.
        if let Some(entry) = self.sessions.write().await.get_mut(id) {
            entry.apply(Transition::MatchSettled);
        }

        match result {
            Ok(MatchResult::Found(peer)) => {
                if let Some(entry) = self.sessions.read().await.get(&peer) {
                    entry.notify(SessionEvent::ChosenBy { peer: id.clone() });
                }
                Ok(SessionOutcome::Matched(peer))
            }
            Ok(MatchResult::NotFound) => Ok(SessionOutcome::NoPeerAvailable),
            Err(StoreError::ConnectionLost) => {
                tracing::error!(participant_id = %id, "Store connection lost during match");
                self.tear_down(id).await;
                Err(StoreError::ConnectionLost.into())
            }
            Err(e) => {
                tracing::warn!(participant_id = %id, error = %e, "Match request failed");
                Err(e.into())
            }
        }
    }

    /// Removes `id` from the pool and forgets its session.
    ///
    /// Safe at any time: if the participant was already claimed by someone
    /// else's match, or a request of its own is still in flight, the leave
    /// simply finds nothing to remove.
    pub async fn end_session(&self, id: &ParticipantId) -> Result<(), SessionError> {
        let entry = self.sessions.write().await.remove(id);
        self.finish(id, entry).await
    }

    /// Ends the session only if `connection` still owns it.
    ///
    /// A participant that reconnected under the same id has attached a newer
    /// connection; the old one going away must not remove the new session.
    pub async fn end_connection(
        &self,
        id: &ParticipantId,
        connection: u64,
    ) -> Result<(), SessionError> {
        let entry = {
            let mut sessions = self.sessions.write().await;
            let owned = sessions
                .get(id)
                .is_some_and(|entry| entry.connection() == Some(connection));
            if owned { sessions.remove(id) } else { None }
        };

        match entry {
            Some(entry) => self.finish(id, Some(entry)).await,
            None => {
                tracing::debug!(participant_id = %id, connection, "Connection no longer owns session");
                Ok(())
            }
        }
    }

    /// Like `subscribe`, but also makes a new connection the owner of the
    /// session. Returns the connection token for `end_connection`.
    pub async fn attach(&self, id: &ParticipantId) -> (u64, broadcast::Receiver<SessionEvent>) {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(id.clone()).or_default();
        entry.attach(connection);
        (connection, entry.subscribe())
    }

    /// Subscribes to events for `id`, creating an offline session entry if
    /// none exists yet so nothing is missed between join and subscribe.
    pub async fn subscribe(&self, id: &ParticipantId) -> broadcast::Receiver<SessionEvent> {
        self.sessions
            .write()
            .await
            .entry(id.clone())
            .or_default()
            .subscribe()
    }

    pub async fn state(&self, id: &ParticipantId) -> SessionState {
        self.sessions
            .read()
            .await
            .get(id)
            .map(SessionEntry::state)
            .unwrap_or_default()
    }

    pub async fn sessions(&self) -> Vec<SessionView> {
        let sessions = self.sessions.read().await;
        let mut views: Vec<SessionView> = sessions.iter().map(|(id, entry)| entry.view(id)).collect();
        views.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        views
    }

    async fn finish(
        &self,
        id: &ParticipantId,
        entry: Option<SessionEntry>,
    ) -> Result<(), SessionError> {
        let result = self.store.leave(id).await;

        if let Some(mut entry) = entry {
            entry.apply(Transition::End);
            match &result {
                Ok(()) => entry.release(),
                // Dropping the lease queues the disconnect for the store to apply.
                Err(_) => drop(entry),
            }
        }

        tracing::info!(participant_id = %id, "Session ended");
        result.map_err(Into::into)
    }

    async fn run_match(&self, id: &ParticipantId) -> Result<MatchResult, StoreError> {
        // Seeking participants are drawn only when nobody available is left.
        self.mark(id, RecordStatus::Seeking).await?;

        // The draw resets the caller to Available in its own commit.
        let error = match self.selector.choose_and_release(id).await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if let Err(reset) = self.mark(id, RecordStatus::Available).await {
            // Never leave a Seeking record behind.
            tracing::warn!(participant_id = %id, error = %reset, "Failed to reset participant status, dropping registration");
            if let Err(e) = self.store.leave(id).await {
                tracing::warn!(participant_id = %id, error = %e, "Failed to drop registration");
            }
            if let Some(entry) = self.sessions.write().await.get_mut(id) {
                entry.drop_registration();
            }
        }
        Err(error)
    }

    async fn mark(&self, id: &ParticipantId, status: RecordStatus) -> Result<(), StoreError> {
        let id = id.clone();
        self.store
            .transact(move |pool| match pool.get_mut(&id) {
                Some(record) if record.status != status => {
                    record.status = status;
                    TxOutcome::Commit(())
                }
                _ => TxOutcome::Abort(()),
            })
            .await
    }

    async fn tear_down(&self, id: &ParticipantId) {
        if let Some(mut entry) = self.sessions.write().await.remove(id) {
            entry.apply(Transition::ConnectionLost);
            tracing::warn!(participant_id = %id, "Session torn down");
        }
    }
}
