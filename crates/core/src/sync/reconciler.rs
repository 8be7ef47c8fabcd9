//! Replays the mutation queue against the remote store.

use std::collections::{BTreeMap, HashSet};

use log::{debug, info, warn};
use serde_json::Value;

use crate::config::DrainMode;
use crate::entities::{Entity, EntityId, EntityKind, Payload, ID_FIELD, TEMP_ID_PREFIX};
use crate::errors::{Error, Result};

use super::local_store::{self, LocalStore};
use super::model::DrainReport;
use super::mutation_queue::{MutationEntry, MutationQueue, QueuedMutation};
use super::persistence::KeyValueStore;
use super::query::{Filter, Target};
use super::remote::RemoteStore;

/// Reserved key holding the temp-id → server-id ledger of the current drain.
pub const ID_REMAP_KEY: &str = "__id_remaps";

type IdRemaps = BTreeMap<EntityId, EntityId>;

enum Replay {
    Remote,
    LocalOnly,
}

/// Temporary ids that are both added and deleted within the queue. Neither entry
/// needs to reach the remote store.
fn cancelled_temp_ids(entries: &[QueuedMutation]) -> HashSet<EntityId> {
    let added: HashSet<&EntityId> = entries
        .iter()
        .filter_map(|m| match &m.entry {
            MutationEntry::Add { temp_id, .. } => Some(temp_id),
            _ => None,
        })
        .collect();

    entries
        .iter()
        .filter_map(|m| match &m.entry {
            MutationEntry::Delete { id, .. } if id.is_temporary() && added.contains(id) => {
                Some(id.clone())
            }
            _ => None,
        })
        .collect()
}

fn resolve(id: &EntityId, remaps: &IdRemaps) -> EntityId {
    remaps.get(id).cloned().unwrap_or_else(|| id.clone())
}

/// Rewrite string values naming a temporary id that now has a server id.
fn remap_references(payload: &mut Payload, remaps: &IdRemaps) {
    for value in payload.values_mut() {
        if let Value::String(text) = value {
            if !text.starts_with(TEMP_ID_PREFIX) {
                continue;
            }
            if let Some(server_id) = remaps.get(&EntityId::new(text.clone())) {
                *text = server_id.to_string();
            }
        }
    }
}

/// One pass over the queue.
///
/// Entries are replayed strictly in insertion order. In
/// [`DrainMode::AllOrNothing`] the first failure aborts the pass and leaves the
/// whole queue in place; the id ledger persisted along the way keeps a retry from
/// inserting the same `Add` twice. In [`DrainMode::PerEntry`] each entry is
/// removed once applied and rejected entries are dead-lettered.
pub struct Reconciler<'a> {
    remote: &'a dyn RemoteStore,
    local: &'a LocalStore,
    queue: &'a MutationQueue,
    kv: &'a dyn KeyValueStore,
    mode: DrainMode,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        remote: &'a dyn RemoteStore,
        local: &'a LocalStore,
        queue: &'a MutationQueue,
        kv: &'a dyn KeyValueStore,
        mode: DrainMode,
    ) -> Self {
        Self {
            remote,
            local,
            queue,
            kv,
            mode,
        }
    }

    async fn load_remaps(&self) -> Result<IdRemaps> {
        match self.kv.get(ID_REMAP_KEY).await? {
            None => Ok(IdRemaps::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::local(format!("Corrupt id remap ledger: {}", e))),
        }
    }

    async fn save_remaps(&self, remaps: &IdRemaps) -> Result<()> {
        self.kv
            .set(ID_REMAP_KEY, serde_json::to_value(remaps)?)
            .await
    }

    pub async fn drain(&self) -> Result<DrainReport> {
        let entries = self.queue.drain().await?;
        let mut report = DrainReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        info!(
            "[Reconciler] Replaying {} queued mutation(s) ({:?})",
            entries.len(),
            self.mode
        );

        let cancelled = cancelled_temp_ids(&entries);
        let mut remaps = self.load_remaps().await?;

        for mutation in &entries {
            match self.apply(mutation, &cancelled, &mut remaps).await {
                Ok(Replay::Remote) => report.applied += 1,
                Ok(Replay::LocalOnly) => report.skipped += 1,
                Err(err) if self.mode == DrainMode::PerEntry && err.is_rejection() => {
                    warn!(
                        "[Reconciler] Discarding {} #{} rejected by remote: {}",
                        mutation.entry.label(),
                        mutation.seq,
                        err
                    );
                    self.queue.discard(mutation.seq, err.to_string()).await?;
                    report.discarded += 1;
                    continue;
                }
                Err(err) => {
                    warn!(
                        "[Reconciler] Drain aborted at {} #{}: {}",
                        mutation.entry.label(),
                        mutation.seq,
                        err
                    );
                    return Err(err);
                }
            }
            if self.mode == DrainMode::PerEntry {
                self.queue.remove(mutation.seq).await?;
            }
        }

        if self.mode == DrainMode::AllOrNothing {
            self.queue.clear().await?;
        }
        self.kv.remove(ID_REMAP_KEY).await?;
        info!(
            "[Reconciler] Drain complete: applied={} skipped={} discarded={}",
            report.applied, report.skipped, report.discarded
        );
        Ok(report)
    }

    async fn apply(
        &self,
        mutation: &QueuedMutation,
        cancelled: &HashSet<EntityId>,
        remaps: &mut IdRemaps,
    ) -> Result<Replay> {
        debug!(
            "[Reconciler] Applying {} #{} on {}",
            mutation.entry.label(),
            mutation.seq,
            mutation.entry.kind()
        );
        match &mutation.entry {
            MutationEntry::Add {
                kind,
                payload,
                temp_id,
            } => {
                if cancelled.contains(temp_id) {
                    debug!("[Reconciler] {} deleted before sync, not inserting", temp_id);
                    return Ok(Replay::LocalOnly);
                }
                if let Some(server_id) = remaps.get(temp_id) {
                    debug!(
                        "[Reconciler] {} already inserted as {}",
                        temp_id, server_id
                    );
                    self.rename_local(*kind, temp_id, server_id).await?;
                    return Ok(Replay::LocalOnly);
                }

                let mut row = payload.clone();
                row.remove(ID_FIELD);
                remap_references(&mut row, remaps);
                let server = self.remote.insert(kind.collection(), row).await?;

                remaps.insert(temp_id.clone(), server.id.clone());
                self.save_remaps(remaps).await?;

                let mut entities = self.local.get(*kind).await?;
                if local_store::replace_id(&mut entities, temp_id, server) {
                    self.local.put(*kind, &entities).await?;
                }
                Ok(Replay::Remote)
            }
            MutationEntry::Delete { kind, id } => {
                let target = resolve(id, remaps);
                let replay = if target.is_temporary() {
                    debug!("[Reconciler] {} never reached the remote, deleting locally", id);
                    Replay::LocalOnly
                } else {
                    self.remote
                        .delete(kind.collection(), &Target::Id(target.clone()))
                        .await?;
                    Replay::Remote
                };

                let mut entities = self.local.get(*kind).await?;
                let removed_temp = local_store::remove(&mut entities, id).is_some();
                let removed_target = local_store::remove(&mut entities, &target).is_some();
                if removed_temp || removed_target {
                    self.local.put(*kind, &entities).await?;
                }
                Ok(replay)
            }
            MutationEntry::Update { kind, id, patch } => {
                let target = resolve(id, remaps);
                if target.is_temporary() {
                    if !cancelled.contains(id) {
                        warn!("[Reconciler] No server id for {}, update kept local", id);
                    }
                    return Ok(Replay::LocalOnly);
                }

                let mut patch = patch.clone();
                remap_references(&mut patch, remaps);
                let rows = self
                    .remote
                    .update(kind.collection(), &Target::Id(target), patch)
                    .await?;

                let mut entities = self.local.get(*kind).await?;
                for row in rows {
                    local_store::upsert(&mut entities, row);
                }
                self.local.put(*kind, &entities).await?;
                Ok(Replay::Remote)
            }
            MutationEntry::BulkRename {
                kind,
                field,
                old_value,
                new_value,
            } => {
                let mut patch = Payload::new();
                patch.insert(field.clone(), new_value.clone());
                let target = Target::Filter(vec![Filter::eq(field.clone(), old_value.clone())]);
                self.remote
                    .update(kind.collection(), &target, patch)
                    .await?;
                Ok(Replay::Remote)
            }
        }
    }

    /// Finish an id swap that a previous, interrupted drain recorded in the ledger.
    async fn rename_local(
        &self,
        kind: EntityKind,
        temp_id: &EntityId,
        server_id: &EntityId,
    ) -> Result<()> {
        let mut entities = self.local.get(kind).await?;
        let Some(current) = entities.iter().find(|e| &e.id == temp_id).cloned() else {
            return Ok(());
        };
        let renamed = Entity::new(server_id.clone(), current.fields);
        if local_store::replace_id(&mut entities, temp_id, renamed) {
            self.local.put(kind, &entities).await?;
        }
        Ok(())
    }
}
