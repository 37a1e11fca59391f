pub mod error;
pub mod lease;
pub mod memory;
pub mod selector;
pub mod store;

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub use error::StoreError;
pub use lease::PresenceLease;
pub use memory::MemoryStore;
pub use selector::{MatchResult, MatchSelector};
pub use store::{PresenceStore, TxOutcome};

/// Opaque identifier of one online endpoint.
///
/// Assigned by the caller and stable for the lifetime of one presence session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(transparent)]
#[ts(export)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<uuid::Uuid> for ParticipantId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Whether a registered participant may currently be handed out as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum RecordStatus {
    #[default]
    Available,
    /// The participant is itself running a match request.
    Seeking,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PresenceRecord {
    pub id: ParticipantId,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: RecordStatus,
}

impl PresenceRecord {
    pub fn new(id: ParticipantId) -> Self {
        let now = Utc::now();
        Self {
            id,
            joined_at: now,
            last_seen: now,
            status: RecordStatus::Available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == RecordStatus::Available
    }
}

/// Every participant currently registered, keyed by id.
pub type PresencePool = BTreeMap<ParticipantId, PresenceRecord>;
