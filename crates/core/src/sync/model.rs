//! Engine-facing models: operations, outcomes and observable status.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Entity, EntityId, EntityKind, Payload};

use super::connectivity::ConnectivityState;

/// Sync engine state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Offline,
    OnlineIdle,
    OnlineSyncing,
}

/// A domain write issued by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Add {
        kind: EntityKind,
        payload: Payload,
    },
    Update {
        kind: EntityKind,
        id: EntityId,
        patch: Payload,
    },
    Delete {
        kind: EntityKind,
        id: EntityId,
    },
    /// Set `field` to `new_value` on every entity of `kind` where it equals `old_value`.
    BulkRename {
        kind: EntityKind,
        field: String,
        old_value: Value,
        new_value: Value,
    },
}

impl WriteOperation {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Add { kind, .. }
            | Self::Update { kind, .. }
            | Self::Delete { kind, .. }
            | Self::BulkRename { kind, .. } => *kind,
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The added or updated entity as it now sits in the local store.
    pub entity: Option<Entity>,
    /// Number of local entities touched.
    pub affected: usize,
    /// True when the write was recorded in the mutation queue instead of being
    /// applied remotely.
    pub queued: bool,
}

/// Summary of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Entries sent to the remote store.
    pub applied: usize,
    /// Entries that only had local meaning and were not sent.
    pub skipped: usize,
    /// Entries moved to the dead-letter list.
    pub discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(DrainReport),
    /// Another drain was in flight; this trigger was ignored.
    AlreadyRunning,
    /// The engine is offline; nothing was attempted.
    Offline,
}

/// Observable engine status for UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub connectivity: ConnectivityState,
    pub engine_state: EngineState,
    pub is_syncing: bool,
    pub pending_mutations: usize,
    pub last_error: Option<String>,
    pub last_synced_at: Option<String>,
    /// Bumped on every local store change so subscribers know to re-read.
    pub revision: u64,
}

impl SyncStatus {
    pub fn new(connectivity: ConnectivityState) -> Self {
        Self {
            connectivity,
            engine_state: match connectivity {
                ConnectivityState::Online => EngineState::OnlineIdle,
                ConnectivityState::Offline => EngineState::Offline,
            },
            is_syncing: false,
            pending_mutations: 0,
            last_error: None,
            last_synced_at: None,
            revision: 0,
        }
    }
}
