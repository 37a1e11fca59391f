use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::{
    ParticipantId, PresenceLease, PresencePool, PresenceRecord, RecordStatus, StoreError,
    lease::Disconnect,
    store::{PresenceStore, TxOutcome},
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 25;

#[derive(Debug, Default)]
struct VersionedPool {
    version: u64,
    pool: PresencePool,
    // participant -> epoch of the lease currently allowed to remove it
    hooks: HashMap<ParticipantId, u64>,
}

impl VersionedPool {
    fn remove(&mut self, id: &ParticipantId) -> bool {
        self.hooks.remove(id);
        if self.pool.remove(id).is_some() {
            self.version += 1;
            true
        } else {
            false
        }
    }
}

/// In-process presence store.
///
/// The pool is versioned; a transaction commits only if the version it read
/// is still current, which gives compare-and-swap semantics over the whole
/// pool without holding the lock while the caller's closure runs.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<VersionedPool>,
    next_epoch: AtomicU64,
    disconnect_tx: mpsc::UnboundedSender<Disconnect>,
    disconnect_rx: Mutex<mpsc::UnboundedReceiver<Disconnect>>,
    closed: AtomicBool,
    max_attempts: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }

    /// `max_attempts` counts every run of a transaction closure, so `1`
    /// means no retry at all.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        Self {
            state: RwLock::new(VersionedPool::default()),
            next_epoch: AtomicU64::new(1),
            disconnect_tx,
            disconnect_rx: Mutex::new(disconnect_rx),
            closed: AtomicBool::new(false),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Takes the store offline. Every later operation fails with
    /// `StoreError::ConnectionLost`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("Presence store closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            Err(StoreError::ConnectionLost)
        } else {
            Ok(())
        }
    }

    /// Applies disconnects queued by dropped leases.
    async fn apply_disconnects(&self) -> Vec<ParticipantId> {
        let pending = {
            let mut rx = self.disconnect_rx.lock().await;
            let mut pending = Vec::new();
            while let Ok(notice) = rx.try_recv() {
                pending.push(notice);
            }
            pending
        };

        if pending.is_empty() {
            return Vec::new();
        }

        let mut state = self.state.write().await;
        let mut removed = Vec::new();
        for notice in pending {
            // A newer join re-armed the hook with a later epoch; the old
            // connection no longer owns the record.
            if state.hooks.get(&notice.participant_id) != Some(&notice.epoch) {
                tracing::debug!(participant_id = %notice.participant_id, epoch = notice.epoch, "Ignoring stale disconnect");
                continue;
            }
            if state.remove(&notice.participant_id) {
                tracing::info!(participant_id = %notice.participant_id, "Removed participant after connection loss");
                removed.push(notice.participant_id);
            }
        }
        removed
    }

    async fn try_commit(&self, read_version: u64, mut pool: PresencePool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.version != read_version {
            return Err(StoreError::Conflict);
        }
        // touch() does not bump the version; keep the newer last_seen.
        for (id, record) in pool.iter_mut() {
            if let Some(current) = state.pool.get(id) {
                record.last_seen = record.last_seen.max(current.last_seen);
            }
        }
        state.pool = pool;
        state.version += 1;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn join(&self, id: &ParticipantId) -> Result<PresenceLease, StoreError> {
        self.ensure_open()?;
        self.apply_disconnects().await;

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.write().await;
        state
            .pool
            .entry(id.clone())
            .and_modify(|record| {
                record.last_seen = Utc::now();
                record.status = RecordStatus::Available;
            })
            .or_insert_with(|| PresenceRecord::new(id.clone()));
        state.hooks.insert(id.clone(), epoch);
        state.version += 1;

        tracing::debug!(participant_id = %id, epoch, "Participant joined pool");
        Ok(PresenceLease::new(id.clone(), epoch, self.disconnect_tx.clone()))
    }

    async fn leave(&self, id: &ParticipantId) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.apply_disconnects().await;

        let removed = self.state.write().await.remove(id);
        tracing::debug!(participant_id = %id, removed, "Participant left pool");
        Ok(())
    }

    async fn transact<R, F>(&self, mut f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnMut(&mut PresencePool) -> TxOutcome<R> + Send,
    {
        self.apply_disconnects().await;

        for attempt in 1..=self.max_attempts {
            self.ensure_open()?;

            let (read_version, mut working) = {
                let state = self.state.read().await;
                (state.version, state.pool.clone())
            };

            let result = match f(&mut working) {
                TxOutcome::Abort(result) => return Ok(result),
                TxOutcome::Commit(result) => result,
            };

            match self.try_commit(read_version, working).await {
                Ok(()) => return Ok(result),
                Err(StoreError::Conflict) => {
                    tracing::trace!(attempt, read_version, "Transaction conflicted, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(attempts = self.max_attempts, "Transaction retry budget exhausted");
        Err(StoreError::RetryExhausted {
            attempts: self.max_attempts,
        })
    }

    async fn touch(&self, id: &ParticipantId) -> Result<(), StoreError> {
        self.ensure_open()?;
        // last_seen is outside the version; heartbeats must not conflict with
        // transactions in flight.
        if let Some(record) = self.state.write().await.pool.get_mut(id) {
            record.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<PresencePool, StoreError> {
        self.ensure_open()?;
        self.apply_disconnects().await;
        Ok(self.state.read().await.pool.clone())
    }

    async fn reap_expired(&self, ttl: Duration) -> Result<Vec<ParticipantId>, StoreError> {
        self.ensure_open()?;
        let mut removed = self.apply_disconnects().await;

        let Some(cutoff) = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(removed);
        };

        let mut state = self.state.write().await;
        let expired: Vec<ParticipantId> = state
            .pool
            .values()
            .filter(|record| record.last_seen < cutoff)
            .map(|record| record.id.clone())
            .collect();
        for id in expired {
            if state.remove(&id) {
                tracing::info!(participant_id = %id, "Lease expired, participant removed");
                removed.push(id);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    async fn members(store: &MemoryStore) -> Vec<String> {
        store
            .snapshot()
            .await
            .unwrap()
            .keys()
            .map(|id| id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn join_refreshes_existing_record() {
        let store = MemoryStore::new();
        let first = store.join(&pid("a")).await.unwrap();
        let joined_at = store.snapshot().await.unwrap()[&pid("a")].joined_at;

        let second = store.join(&pid("a")).await.unwrap();
        let pool = store.snapshot().await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[&pid("a")].joined_at, joined_at);
        assert!(second.epoch() > first.epoch());

        first.release();
        second.release();
    }

    #[tokio::test]
    async fn leave_twice_is_noop() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();
        let b = store.join(&pid("b")).await.unwrap();

        store.leave(&pid("a")).await.unwrap();
        let after_once = members(&store).await;
        store.leave(&pid("a")).await.unwrap();
        assert_eq!(members(&store).await, after_once);
        assert_eq!(after_once, vec!["b"]);

        drop(a);
        b.release();
        // a's hook was cancelled by the leave, its drop must not touch b.
        assert_eq!(members(&store).await, vec!["b"]);
    }

    #[tokio::test]
    async fn dropped_lease_removes_participant() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();
        let b = store.join(&pid("b")).await.unwrap();

        drop(a);
        assert_eq!(members(&store).await, vec!["b"]);
        b.release();
    }

    #[tokio::test]
    async fn stale_lease_does_not_evict_rejoined_participant() {
        let store = MemoryStore::new();
        let old = store.join(&pid("a")).await.unwrap();
        let fresh = store.join(&pid("a")).await.unwrap();

        drop(old);
        assert_eq!(members(&store).await, vec!["a"]);

        drop(fresh);
        assert!(members(&store).await.is_empty());
    }

    #[tokio::test]
    async fn abort_leaves_pool_untouched() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();
        let version = store.version().await;

        let len = store
            .transact(|pool| {
                pool.clear();
                TxOutcome::Abort(pool.len())
            })
            .await
            .unwrap();

        assert_eq!(len, 0);
        assert_eq!(store.version().await, version);
        assert_eq!(members(&store).await, vec!["a"]);
        a.release();
    }

    #[tokio::test]
    async fn commit_replaces_pool() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();

        store
            .transact(|pool| {
                pool.insert(pid("z"), PresenceRecord::new(pid("z")));
                TxOutcome::Commit(())
            })
            .await
            .unwrap();

        assert_eq!(members(&store).await, vec!["a", "z"]);
        a.release();
    }

    #[tokio::test]
    async fn conflicting_writer_is_retried_with_fresh_snapshot() {
        let store = MemoryStore::new();
        let mut runs = 0;

        let seen = store
            .transact(|pool| {
                runs += 1;
                if runs == 1 {
                    // Another writer sneaks in between read and commit.
                    let mut state = store.state.try_write().unwrap();
                    state.pool.insert(pid("late"), PresenceRecord::new(pid("late")));
                    state.version += 1;
                }
                let seen = pool.contains_key(&pid("late"));
                pool.insert(pid("mine"), PresenceRecord::new(pid("mine")));
                TxOutcome::Commit(seen)
            })
            .await
            .unwrap();

        assert_eq!(runs, 2);
        assert!(seen);
        assert_eq!(members(&store).await, vec!["late", "mine"]);
    }

    #[tokio::test]
    async fn heartbeat_does_not_conflict_with_transaction() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();
        let version = store.version().await;
        store.touch(&pid("a")).await.unwrap();
        assert_eq!(store.version().await, version);

        let heartbeat = Utc::now() + chrono::Duration::seconds(30);
        let mut runs = 0;
        store
            .transact(|pool| {
                runs += 1;
                // A pong lands while the closure works on its copy.
                let mut state = store.state.try_write().unwrap();
                state.pool.get_mut(&pid("a")).unwrap().last_seen = heartbeat;
                pool.get_mut(&pid("a")).unwrap().status = RecordStatus::Seeking;
                TxOutcome::Commit(())
            })
            .await
            .unwrap();

        assert_eq!(runs, 1);
        let pool = store.snapshot().await.unwrap();
        assert_eq!(pool[&pid("a")].last_seen, heartbeat);
        assert_eq!(pool[&pid("a")].status, RecordStatus::Seeking);
        a.release();
    }

    #[tokio::test]
    async fn persistent_conflict_exhausts_retries() {
        let store = MemoryStore::with_max_attempts(3);
        let mut runs = 0;

        let result = store
            .transact(|_pool| {
                runs += 1;
                store.state.try_write().unwrap().version += 1;
                TxOutcome::Commit(())
            })
            .await;

        assert_eq!(result, Err(StoreError::RetryExhausted { attempts: 3 }));
        assert_eq!(runs, 3);
    }

    #[tokio::test]
    async fn closed_store_reports_connection_lost() {
        let store = MemoryStore::new();
        store.close();

        assert_eq!(
            store.join(&pid("a")).await.unwrap_err(),
            StoreError::ConnectionLost
        );
        assert_eq!(store.leave(&pid("a")).await, Err(StoreError::ConnectionLost));
        assert_eq!(
            store.transact(|_| TxOutcome::Commit(())).await,
            Err(StoreError::ConnectionLost)
        );
    }

    #[tokio::test]
    async fn reap_expired_removes_silent_participants() {
        let store = MemoryStore::new();
        let a = store.join(&pid("a")).await.unwrap();
        let b = store.join(&pid("b")).await.unwrap();

        {
            let mut state = store.state.write().await;
            let record = state.pool.get_mut(&pid("a")).unwrap();
            record.last_seen = Utc::now() - chrono::Duration::seconds(120);
        }
        store.touch(&pid("b")).await.unwrap();

        let removed = store.reap_expired(Duration::from_secs(60)).await.unwrap();
        assert_eq!(removed, vec![pid("a")]);
        assert_eq!(members(&store).await, vec!["b"]);

        a.release();
        b.release();
    }
}
