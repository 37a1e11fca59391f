use std::time::Duration;

use async_trait::async_trait;

use super::{ParticipantId, PresenceLease, PresencePool, StoreError};

/// What a transaction closure wants done with its working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome<R> {
    /// Write the working copy back as the new pool state.
    Commit(R),
    /// Leave the persisted pool untouched.
    Abort(R),
}

/// Shared presence storage with optimistic whole-pool transactions.
///
/// Implementations must serialize conflicting `transact` calls so that each
/// closure run that commits saw the pool exactly as it was at commit time.
/// Losing runs are retried with a fresh snapshot until the attempt budget
/// runs out.
#[async_trait]
pub trait PresenceStore: Send + Sync + 'static {
    /// Registers `id` and arms its disconnect hook.
    ///
    /// Dropping the returned lease removes the record unless it was already
    /// left or superseded by a newer `join`.
    async fn join(&self, id: &ParticipantId) -> Result<PresenceLease, StoreError>;

    /// Removes `id` and cancels its disconnect hook. No-op when absent.
    async fn leave(&self, id: &ParticipantId) -> Result<(), StoreError>;

    /// Optimistic read-modify-write against the whole pool.
    ///
    /// `f` may run several times and must not have side effects beyond its
    /// working copy and return value.
    async fn transact<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnMut(&mut PresencePool) -> TxOutcome<R> + Send;

    /// Heartbeat: marks `id` as recently seen.
    async fn touch(&self, id: &ParticipantId) -> Result<(), StoreError>;

    async fn snapshot(&self) -> Result<PresencePool, StoreError>;

    /// Removes participants not seen within `ttl` and applies pending
    /// disconnects. Returns the ids that were removed.
    async fn reap_expired(&self, ttl: Duration) -> Result<Vec<ParticipantId>, StoreError>;
}
