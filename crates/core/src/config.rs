//! Sync engine configuration.

use serde::{Deserialize, Serialize};

use crate::entities::EntityKind;
use crate::sync::CONNECTIVITY_PROBE_INTERVAL_SECS;

/// How the reconciler treats the queue when an entry fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainMode {
    /// Any failure aborts the drain and leaves the whole queue for a full retry.
    #[default]
    AllOrNothing,
    /// Applied entries are removed one by one; rejected entries are dead-lettered.
    PerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Collections mirrored locally and reloaded on every refresh.
    pub collections: Vec<EntityKind>,
    pub drain_mode: DrainMode,
    /// Reachability probe cadence in seconds.
    pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collections: EntityKind::ALL.to_vec(),
            drain_mode: DrainMode::default(),
            probe_interval_secs: CONNECTIVITY_PROBE_INTERVAL_SECS,
        }
    }
}

impl SyncConfig {
    pub fn with_drain_mode(mut self, drain_mode: DrainMode) -> Self {
        self.drain_mode = drain_mode;
        self
    }
}
