use std::sync::Arc;

use rand::{Rng, rngs::OsRng};
use serde::{Deserialize, Serialize};

use super::{ParticipantId, PresencePool, PresenceStore, RecordStatus, StoreError, TxOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    Found(ParticipantId),
    NotFound,
}

/// Hands out random peers from the presence pool.
#[derive(Debug)]
pub struct MatchSelector<S: PresenceStore> {
    store: Arc<S>,
}

impl<S: PresenceStore> Clone for MatchSelector<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: PresenceStore> MatchSelector<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Picks a random peer for `excluding` and removes it from the pool in
    /// the same transaction, so no two callers are ever handed the same peer.
    ///
    /// The caller itself stays registered either way. A caller that is not
    /// (or no longer) in the pool gets `NotFound`: it has either left or was
    /// already claimed by someone else.
    pub async fn choose(&self, excluding: &ParticipantId) -> Result<MatchResult, StoreError> {
        self.run(excluding, false).await
    }

    /// Like `choose`, but also returns a `Seeking` caller to `Available` in
    /// the same commit.
    pub async fn choose_and_release(
        &self,
        excluding: &ParticipantId,
    ) -> Result<MatchResult, StoreError> {
        self.run(excluding, true).await
    }

    async fn run(&self, excluding: &ParticipantId, release: bool) -> Result<MatchResult, StoreError> {
        let caller = excluding.clone();
        let result = self
            .store
            .transact(move |pool| pick_and_remove(pool, &caller, release))
            .await?;

        match &result {
            MatchResult::Found(peer) => {
                tracing::info!(participant_id = %excluding, %peer, "Match target claimed")
            }
            MatchResult::NotFound => {
                tracing::debug!(participant_id = %excluding, "No match candidate available")
            }
        }
        Ok(result)
    }
}

/// Transaction body of `MatchSelector::choose`.
///
/// Runs against a working copy; on conflict the store calls it again with a
/// fresh snapshot, so the draw is always over the pool as it is at commit.
/// Available peers are preferred; peers busy with a request of their own
/// are drawn only when nobody else is left.
pub(crate) fn pick_and_remove(
    pool: &mut PresencePool,
    excluding: &ParticipantId,
    release_caller: bool,
) -> TxOutcome<MatchResult> {
    let Some(caller) = pool.get_mut(excluding) else {
        return TxOutcome::Abort(MatchResult::NotFound);
    };
    let released = release_caller && !caller.is_available();
    if released {
        caller.status = RecordStatus::Available;
    }

    let others = || pool.values().filter(move |record| &record.id != excluding);
    let mut candidates: Vec<&ParticipantId> = others()
        .filter(|record| record.is_available())
        .map(|record| &record.id)
        .collect();
    if candidates.is_empty() {
        candidates = others().map(|record| &record.id).collect();
    }

    if candidates.is_empty() {
        return if released {
            TxOutcome::Commit(MatchResult::NotFound)
        } else {
            TxOutcome::Abort(MatchResult::NotFound)
        };
    }

    let index = OsRng.gen_range(0..candidates.len());
    let chosen = candidates[index].clone();
    tracing::debug!(index, candidates = candidates.len(), "Drew match candidate");

    pool.remove(&chosen);
    TxOutcome::Commit(MatchResult::Found(chosen))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::pool::{MemoryStore, PresenceRecord};

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::from(id)
    }

    fn pool_of(ids: &[&str]) -> PresencePool {
        ids.iter()
            .map(|id| {
                let id = ParticipantId::from(*id);
                (id.clone(), PresenceRecord::new(id))
            })
            .collect()
    }

    #[test]
    fn never_matches_caller_with_itself() {
        let mut pool = pool_of(&["a"]);
        let outcome = pick_and_remove(&mut pool, &pid("a"), false);
        assert_eq!(outcome, TxOutcome::Abort(MatchResult::NotFound));
        assert!(pool.contains_key(&pid("a")));
    }

    #[test]
    fn empty_pool_has_no_match() {
        let mut pool = PresencePool::new();
        let outcome = pick_and_remove(&mut pool, &pid("a"), false);
        assert_eq!(outcome, TxOutcome::Abort(MatchResult::NotFound));
        assert!(pool.is_empty());
    }

    #[test]
    fn unregistered_caller_has_no_match() {
        let mut pool = pool_of(&["b", "c"]);
        let outcome = pick_and_remove(&mut pool, &pid("a"), false);
        assert_eq!(outcome, TxOutcome::Abort(MatchResult::NotFound));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn available_peers_are_preferred_over_seeking_ones() {
        let mut pool = pool_of(&["a", "b", "c"]);
        pool.get_mut(&pid("b")).unwrap().status = RecordStatus::Seeking;

        let outcome = pick_and_remove(&mut pool, &pid("a"), false);
        assert_eq!(outcome, TxOutcome::Commit(MatchResult::Found(pid("c"))));
        assert!(pool.contains_key(&pid("b")));
    }

    #[test]
    fn two_seekers_still_match_each_other() {
        let mut pool = pool_of(&["a", "b"]);
        for record in pool.values_mut() {
            record.status = RecordStatus::Seeking;
        }

        let outcome = pick_and_remove(&mut pool, &pid("a"), false);
        assert_eq!(outcome, TxOutcome::Commit(MatchResult::Found(pid("b"))));

        // b was claimed before its own draw ran.
        let outcome = pick_and_remove(&mut pool, &pid("b"), false);
        assert_eq!(outcome, TxOutcome::Abort(MatchResult::NotFound));
        assert_eq!(pool.keys().cloned().collect::<Vec<_>>(), vec![pid("a")]);
    }

    #[test]
    fn release_resets_caller_in_the_same_commit() {
        let mut pool = pool_of(&["a", "b"]);
        pool.get_mut(&pid("a")).unwrap().status = RecordStatus::Seeking;

        let outcome = pick_and_remove(&mut pool, &pid("a"), true);
        assert_eq!(outcome, TxOutcome::Commit(MatchResult::Found(pid("b"))));
        assert!(pool[&pid("a")].is_available());

        // With nobody to draw, the reset alone is still committed.
        pool.get_mut(&pid("a")).unwrap().status = RecordStatus::Seeking;
        let outcome = pick_and_remove(&mut pool, &pid("a"), true);
        assert_eq!(outcome, TxOutcome::Commit(MatchResult::NotFound));
        assert!(pool[&pid("a")].is_available());
    }

    #[test]
    fn found_peer_is_removed_and_caller_kept() {
        let mut pool = pool_of(&["a", "b", "c"]);
        let TxOutcome::Commit(MatchResult::Found(peer)) = pick_and_remove(&mut pool, &pid("a"), false)
        else {
            panic!("expected a committed match");
        };

        assert!(peer == pid("b") || peer == pid("c"));
        assert!(!pool.contains_key(&peer));
        assert!(pool.contains_key(&pid("a")));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn draws_are_roughly_uniform() {
        const TRIALS: usize = 6000;
        let ids = ["a", "b", "c", "d"];
        let mut counts: HashMap<ParticipantId, usize> = HashMap::new();

        for _ in 0..TRIALS {
            let mut pool = pool_of(&ids);
            if let TxOutcome::Commit(MatchResult::Found(peer)) =
                pick_and_remove(&mut pool, &pid("a"), false)
            {
                *counts.entry(peer).or_default() += 1;
            }
        }

        let expected = TRIALS / 3;
        assert_eq!(counts.len(), 3);
        assert_eq!(counts.values().sum::<usize>(), TRIALS);
        for (peer, count) in counts {
            // ~8 standard deviations of slack; a biased draw is far outside it.
            let delta = count.abs_diff(expected);
            assert!(delta < 300, "{peer} drawn {count} times, expected about {expected}");
        }
    }

    #[tokio::test]
    async fn choose_commits_removal() {
        let store = Arc::new(MemoryStore::new());
        let leases = vec![
            store.join(&pid("a")).await.unwrap(),
            store.join(&pid("b")).await.unwrap(),
        ];
        let selector = MatchSelector::new(Arc::clone(&store));

        let result = selector.choose(&pid("a")).await.unwrap();
        assert_eq!(result, MatchResult::Found(pid("b")));

        let pool = store.snapshot().await.unwrap();
        assert_eq!(pool.keys().cloned().collect::<Vec<_>>(), vec![pid("a")]);
        leases.into_iter().for_each(|lease| lease.release());
    }
}
