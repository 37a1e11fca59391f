use tokio::sync::mpsc;

use super::ParticipantId;

/// Notice that the connection owning a presence registration went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub participant_id: ParticipantId,
    pub epoch: u64,
}

/// Disconnect hook armed by `PresenceStore::join`.
///
/// Hold it for as long as the participant's connection is alive. When it is
/// dropped the store is told to remove the registration it was issued for.
/// A lease only ever removes the registration of its own epoch, so a stale
/// lease from an earlier connection cannot evict a participant who has
/// joined again since.
#[derive(Debug)]
#[must_use = "PresenceLease must be kept, otherwise the participant is immediately removed"]
pub struct PresenceLease {
    participant_id: ParticipantId,
    epoch: u64,
    notifier: Option<mpsc::UnboundedSender<Disconnect>>,
}

impl PresenceLease {
    pub fn new(
        participant_id: ParticipantId,
        epoch: u64,
        notifier: mpsc::UnboundedSender<Disconnect>,
    ) -> Self {
        Self {
            participant_id,
            epoch,
            notifier: Some(notifier),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Drops the lease without signalling a disconnect.
    ///
    /// Used after an explicit leave, which already cancelled the hook.
    pub fn release(mut self) {
        self.notifier = None;
    }
}

impl Drop for PresenceLease {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.take() {
            let notice = Disconnect {
                participant_id: self.participant_id.clone(),
                epoch: self.epoch,
            };
            // The store may already be gone, in which case there is nothing to clean.
            if notifier.send(notice).is_err() {
                tracing::trace!(participant_id = %self.participant_id, "Presence store dropped before lease");
            } else {
                tracing::debug!(participant_id = %self.participant_id, epoch = self.epoch, "Lease dropped, disconnect queued");
            }
        }
    }
}
