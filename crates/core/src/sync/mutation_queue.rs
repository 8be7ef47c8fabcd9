//! Durable FIFO log of writes made while offline.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::entities::{EntityId, EntityKind, Payload};
use crate::errors::{Error, Result};

use super::persistence::KeyValueStore;

/// Reserved key holding the queue document.
pub const MUTATION_QUEUE_KEY: &str = "__mutation_queue";

/// Reserved key holding entries discarded as irrecoverable.
pub const DEAD_LETTER_KEY: &str = "__dead_letters";

/// A write waiting to be replayed against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationEntry {
    Add {
        kind: EntityKind,
        payload: Payload,
        temp_id: EntityId,
    },
    Delete {
        kind: EntityKind,
        id: EntityId,
    },
    Update {
        kind: EntityKind,
        id: EntityId,
        patch: Payload,
    },
    /// Predicate-based rewrite: every row where `field == old_value` gets `new_value`.
    BulkRename {
        kind: EntityKind,
        field: String,
        old_value: Value,
        new_value: Value,
    },
}

impl MutationEntry {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Add { kind, .. }
            | Self::Delete { kind, .. }
            | Self::Update { kind, .. }
            | Self::BulkRename { kind, .. } => *kind,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::Delete { .. } => "delete",
            Self::Update { .. } => "update",
            Self::BulkRename { .. } => "bulk_rename",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    /// Insertion sequence; strictly increasing and never reused.
    pub seq: u64,
    pub enqueued_at: String,
    pub entry: MutationEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub mutation: QueuedMutation,
    pub reason: String,
    pub discarded_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueDocument {
    next_seq: u64,
    entries: Vec<QueuedMutation>,
}

/// Single log shared by every entity kind, so replay preserves the global write
/// order (a category added offline reaches the remote before the transactions
/// that reference it).
pub struct MutationQueue {
    kv: Arc<dyn KeyValueStore>,
    // Serializes read-modify-write cycles on the queue document.
    lock: Mutex<()>,
}

impl MutationQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<QueueDocument> {
        match self.kv.get(MUTATION_QUEUE_KEY).await? {
            None => Ok(QueueDocument::default()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::local(format!("Corrupt mutation queue: {}", e))),
        }
    }

    async fn save(&self, document: &QueueDocument) -> Result<()> {
        self.kv
            .set(MUTATION_QUEUE_KEY, serde_json::to_value(document)?)
            .await
    }

    pub async fn enqueue(&self, entry: MutationEntry) -> Result<QueuedMutation> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let mutation = QueuedMutation {
            seq: document.next_seq,
            enqueued_at: Utc::now().to_rfc3339(),
            entry,
        };
        document.next_seq += 1;
        document.entries.push(mutation.clone());
        self.save(&document).await?;
        Ok(mutation)
    }

    /// Every pending entry in insertion order. Does not remove anything.
    pub async fn drain(&self) -> Result<Vec<QueuedMutation>> {
        Ok(self.load().await?.entries)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.load().await?.entries.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Drop every entry. Sequence numbers keep counting from where they were.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        document.entries.clear();
        self.save(&document).await
    }

    /// Remove one applied entry.
    pub async fn remove(&self, seq: u64) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let before = document.entries.len();
        document.entries.retain(|m| m.seq != seq);
        if document.entries.len() == before {
            return Ok(false);
        }
        self.save(&document).await?;
        Ok(true)
    }

    /// Move an entry to the dead-letter list. This is the only way an entry
    /// leaves the queue without having been applied remotely.
    pub async fn discard(&self, seq: u64, reason: impl Into<String>) -> Result<Option<DeadLetter>> {
        let _guard = self.lock.lock().await;
        let mut document = self.load().await?;
        let Some(position) = document.entries.iter().position(|m| m.seq == seq) else {
            return Ok(None);
        };
        let dead = DeadLetter {
            mutation: document.entries.remove(position),
            reason: reason.into(),
            discarded_at: Utc::now().to_rfc3339(),
        };

        let mut dead_letters = self.dead_letters().await?;
        dead_letters.push(dead.clone());
        self.kv
            .set(DEAD_LETTER_KEY, serde_json::to_value(&dead_letters)?)
            .await?;
        self.save(&document).await?;
        Ok(Some(dead))
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        match self.kv.get(DEAD_LETTER_KEY).await? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::local(format!("Corrupt dead-letter list: {}", e))),
        }
    }
}
