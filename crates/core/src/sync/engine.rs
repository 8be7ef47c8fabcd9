//! Sync engine: routes reads and writes to the remote store or the local mirror,
//! queues writes made offline and drives replay when connectivity returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::entities::{Entity, EntityId, EntityKind, Payload, ID_FIELD};
use crate::errors::{Error, Result};

use super::connectivity::{
    spawn_probe_loop, ConnectivityMonitor, ConnectivityState, ReachabilityProbe,
};
use super::local_store::{self, LocalStore};
use super::model::{EngineState, SyncOutcome, SyncStatus, WriteOperation, WriteOutcome};
use super::mutation_queue::{DeadLetter, MutationEntry, MutationQueue, QueuedMutation};
use super::persistence::KeyValueStore;
use super::query::{Filter, Query, Target};
use super::reconciler::Reconciler;
use super::remote::RemoteStore;

/// Resets the in-flight flag when a drain ends, even if its future is dropped.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Offline-first sync engine.
///
/// Every public operation runs under one async mutex, so the read-modify-write
/// sections of two operations never interleave and callers observe their writes
/// in call order. Writes only go straight to the remote store when the
/// connectivity monitor reports online *and* the mutation queue is empty;
/// otherwise they join the queue behind the pending entries. The queue is only
/// replayed by [`Self::synchronize`]: on start, on every transition to online,
/// or when a caller asks for it.
pub struct SyncEngine {
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    kv: Arc<dyn KeyValueStore>,
    local: LocalStore,
    queue: MutationQueue,
    monitor: Arc<ConnectivityMonitor>,
    probe: Option<Arc<dyn ReachabilityProbe>>,
    op_lock: Mutex<()>,
    syncing: AtomicBool,
    status: watch::Sender<SyncStatus>,
    listener: Mutex<Option<JoinHandle<()>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        kv: Arc<dyn KeyValueStore>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::new(monitor.state()));
        Self {
            config,
            remote,
            local: LocalStore::new(kv.clone()),
            queue: MutationQueue::new(kv.clone()),
            kv,
            monitor,
            probe: None,
            op_lock: Mutex::new(()),
            syncing: AtomicBool::new(false),
            status,
            listener: Mutex::new(None),
            probe_task: Mutex::new(None),
        }
    }

    /// Poll `probe` every `probe_interval_secs` once the engine is started and
    /// feed the result into the connectivity monitor.
    pub fn with_reachability_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start listening for connectivity transitions and load the initial state:
    /// replay + refresh from the remote when online, the persisted mirror when
    /// offline.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        {
            let mut guard = self.listener.lock().await;
            if guard.as_ref().map_or(true, |handle| handle.is_finished()) {
                *guard = Some(self.spawn_listener());
            }
        }
        if let Some(probe) = &self.probe {
            let mut guard = self.probe_task.lock().await;
            if guard.as_ref().map_or(true, |handle| handle.is_finished()) {
                let interval = Duration::from_secs(self.config.probe_interval_secs);
                *guard = Some(spawn_probe_loop(
                    self.monitor.clone(),
                    probe.clone(),
                    interval,
                ));
            }
        }
        self.update_status(false).await;

        info!(
            "[SyncEngine] Starting {:?} with {} pending mutation(s)",
            self.monitor.state(),
            self.status().pending_mutations
        );
        if self.monitor.is_online() {
            match self.synchronize().await {
                Ok(SyncOutcome::Completed(_)) => return Ok(()),
                // Went offline or another drain is running: load what we have.
                Ok(_) => {}
                // Recorded in the status; the engine keeps serving the local mirror.
                Err(err) if err.is_connectivity() || err.is_rejection() => {}
                Err(err) => return Err(err),
            }
        }
        self.refresh().await
    }

    /// Stop reacting to connectivity transitions and stop probing.
    pub async fn dispose(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.probe_task.lock().await.take() {
            handle.abort();
        }
        debug!("[SyncEngine] Disposed");
    }

    fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let mut rx = self.monitor.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match state {
                    ConnectivityState::Online => {
                        info!("[SyncEngine] Became online, replaying queue");
                        if let Err(err) = engine.synchronize().await {
                            warn!("[SyncEngine] Replay after reconnect failed: {}", err);
                        }
                    }
                    ConnectivityState::Offline => {
                        info!("[SyncEngine] Became offline");
                        engine.publish(|_| {});
                    }
                }
            }
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observable state
    // ─────────────────────────────────────────────────────────────────────────

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.monitor.state()
    }

    pub fn state(&self) -> EngineState {
        if !self.monitor.is_online() {
            EngineState::Offline
        } else if self.syncing.load(Ordering::SeqCst) {
            EngineState::OnlineSyncing
        } else {
            EngineState::OnlineIdle
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    /// Status updates; `revision` changes whenever the local store does.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub async fn pending_mutations(&self) -> Result<Vec<QueuedMutation>> {
        self.queue.drain().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.queue.dead_letters().await
    }

    /// Explicitly give up on a queued mutation that can never be applied.
    pub async fn discard_pending(
        &self,
        seq: u64,
        reason: impl Into<String>,
    ) -> Result<Option<DeadLetter>> {
        let _guard = self.op_lock.lock().await;
        let dead = self.queue.discard(seq, reason).await?;
        if let Some(dead) = &dead {
            warn!(
                "[SyncEngine] Discarded {} #{}: {}",
                dead.mutation.entry.label(),
                seq,
                dead.reason
            );
        }
        self.update_status(false).await;
        Ok(dead)
    }

    fn publish(&self, update: impl FnOnce(&mut SyncStatus)) {
        let connectivity = self.monitor.state();
        let engine_state = self.state();
        let is_syncing = self.is_syncing();
        self.status.send_modify(|status| {
            update(status);
            status.connectivity = connectivity;
            status.engine_state = engine_state;
            status.is_syncing = is_syncing;
        });
    }

    async fn update_status(&self, local_changed: bool) {
        let pending = match self.queue.len().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!("[SyncEngine] Could not count pending mutations: {}", err);
                None
            }
        };
        self.publish(|status| {
            if let Some(count) = pending {
                status.pending_mutations = count;
            }
            if local_changed {
                status.revision += 1;
            }
        });
    }

    fn record_error(&self, err: &Error) {
        if err.is_connectivity() {
            self.monitor.report_unreachable(&err.to_string());
        }
        let message = err.to_string();
        self.publish(|status| status.last_error = Some(message));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a collection. Online, the remote result is mirrored locally before it
    /// is returned; offline, the local snapshot is filtered and ordered here.
    ///
    /// While mutations are pending the remote rows are returned as-is and the
    /// mirror keeps its optimistic state until the next drain.
    pub async fn read(&self, kind: EntityKind, query: &Query) -> Result<Vec<Entity>> {
        let _guard = self.op_lock.lock().await;
        if self.monitor.is_online() {
            let pending = !self.queue.is_empty().await?;
            match self.remote.select(kind.collection(), query).await {
                Ok(rows) if pending => {
                    debug!(
                        "[SyncEngine] Read of {} not mirrored, mutations pending",
                        kind
                    );
                    return Ok(rows);
                }
                Ok(rows) => {
                    let mut entities = if query.is_unfiltered() {
                        Vec::new()
                    } else {
                        self.local.get(kind).await?
                    };
                    local_store::merge_selection(&mut entities, query, &rows);
                    self.local.put(kind, &entities).await?;
                    self.update_status(true).await;
                    return Ok(rows);
                }
                Err(err) if err.is_connectivity() => {
                    warn!("[SyncEngine] Read of {} fell back to local: {}", kind, err);
                    self.record_error(&err);
                }
                Err(err) => {
                    self.record_error(&err);
                    return Err(err);
                }
            }
        }
        Ok(query.apply(self.local.get(kind).await?))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn write(&self, operation: WriteOperation) -> Result<WriteOutcome> {
        let _guard = self.op_lock.lock().await;
        if self.remote_writable_locked().await? {
            match self.write_remote(&operation).await {
                Ok(outcome) => {
                    self.update_status(true).await;
                    return Ok(outcome);
                }
                Err(err) if err.is_connectivity() => {
                    warn!(
                        "[SyncEngine] Remote write on {} failed, queueing instead: {}",
                        operation.kind(),
                        err
                    );
                    self.record_error(&err);
                }
                Err(err) => {
                    self.record_error(&err);
                    return Err(err);
                }
            }
        }
        let outcome = self.write_offline(operation).await?;
        self.update_status(true).await;
        Ok(outcome)
    }

    async fn write_remote(&self, operation: &WriteOperation) -> Result<WriteOutcome> {
        match operation {
            WriteOperation::Add { kind, payload } => {
                let mut row = payload.clone();
                row.remove(ID_FIELD);
                let entity = self.remote.insert(kind.collection(), row).await?;

                let mut entities = self.local.get(*kind).await?;
                local_store::upsert(&mut entities, entity.clone());
                self.local.put(*kind, &entities).await?;
                Ok(WriteOutcome {
                    entity: Some(entity),
                    affected: 1,
                    queued: false,
                })
            }
            WriteOperation::Update { kind, id, patch } => {
                let rows = self
                    .remote
                    .update(kind.collection(), &Target::Id(id.clone()), patch.clone())
                    .await?;
                if rows.is_empty() {
                    return Err(Error::not_found(kind.collection(), id.as_str()));
                }

                let mut entities = self.local.get(*kind).await?;
                for row in &rows {
                    local_store::upsert(&mut entities, row.clone());
                }
                self.local.put(*kind, &entities).await?;
                Ok(WriteOutcome {
                    affected: rows.len(),
                    entity: rows.into_iter().next(),
                    queued: false,
                })
            }
            WriteOperation::Delete { kind, id } => {
                self.remote
                    .delete(kind.collection(), &Target::Id(id.clone()))
                    .await?;

                let mut entities = self.local.get(*kind).await?;
                let removed = local_store::remove(&mut entities, id).is_some();
                if removed {
                    self.local.put(*kind, &entities).await?;
                }
                Ok(WriteOutcome {
                    entity: None,
                    affected: usize::from(removed),
                    queued: false,
                })
            }
            WriteOperation::BulkRename {
                kind,
                field,
                old_value,
                new_value,
            } => {
                let mut patch = Payload::new();
                patch.insert(field.clone(), new_value.clone());
                let target = Target::Filter(vec![Filter::eq(field.clone(), old_value.clone())]);
                let rows = self
                    .remote
                    .update(kind.collection(), &target, patch)
                    .await?;

                let mut entities = self.local.get(*kind).await?;
                for row in &rows {
                    local_store::upsert(&mut entities, row.clone());
                }
                local_store::rename_field(&mut entities, field, old_value, new_value);
                self.local.put(*kind, &entities).await?;
                Ok(WriteOutcome {
                    entity: None,
                    affected: rows.len(),
                    queued: false,
                })
            }
        }
    }

    /// Optimistic local write plus queue entry. The entry is persisted first so
    /// a failure between the two steps can never lose the mutation.
    ///
    /// Updating an id the mirror does not hold is refused with `NotFound` rather
    /// than queued: a stale temporary id would otherwise be replayed after its
    /// remap was dropped and silently do nothing.
    async fn write_offline(&self, operation: WriteOperation) -> Result<WriteOutcome> {
        match operation {
            WriteOperation::Add { kind, mut payload } => {
                payload.remove(ID_FIELD);
                let temp_id = EntityId::temporary();
                self.queue
                    .enqueue(MutationEntry::Add {
                        kind,
                        payload: payload.clone(),
                        temp_id: temp_id.clone(),
                    })
                    .await?;

                let entity = Entity::new(temp_id, payload);
                let mut entities = self.local.get(kind).await?;
                entities.push(entity.clone());
                self.local.put(kind, &entities).await?;
                debug!("[SyncEngine] Queued add of {} on {}", entity.id, kind);
                Ok(WriteOutcome {
                    entity: Some(entity),
                    affected: 1,
                    queued: true,
                })
            }
            WriteOperation::Update { kind, id, patch } => {
                let mut entities = self.local.get(kind).await?;
                if !entities.iter().any(|e| e.id == id) {
                    return Err(Error::not_found(kind.collection(), id.as_str()));
                }
                self.queue
                    .enqueue(MutationEntry::Update {
                        kind,
                        id: id.clone(),
                        patch: patch.clone(),
                    })
                    .await?;

                let updated = local_store::patch(&mut entities, &id, &patch);
                self.local.put(kind, &entities).await?;
                debug!("[SyncEngine] Queued update of {} on {}", id, kind);
                Ok(WriteOutcome {
                    entity: updated,
                    affected: 1,
                    queued: true,
                })
            }
            WriteOperation::Delete { kind, id } => {
                self.queue
                    .enqueue(MutationEntry::Delete {
                        kind,
                        id: id.clone(),
                    })
                    .await?;

                let mut entities = self.local.get(kind).await?;
                let removed = local_store::remove(&mut entities, &id).is_some();
                if removed {
                    self.local.put(kind, &entities).await?;
                }
                debug!("[SyncEngine] Queued delete of {} on {}", id, kind);
                Ok(WriteOutcome {
                    entity: None,
                    affected: usize::from(removed),
                    queued: true,
                })
            }
            WriteOperation::BulkRename {
                kind,
                field,
                old_value,
                new_value,
            } => {
                self.queue
                    .enqueue(MutationEntry::BulkRename {
                        kind,
                        field: field.clone(),
                        old_value: old_value.clone(),
                        new_value: new_value.clone(),
                    })
                    .await?;

                let mut entities = self.local.get(kind).await?;
                let renamed =
                    local_store::rename_field(&mut entities, &field, &old_value, &new_value);
                if renamed > 0 {
                    self.local.put(kind, &entities).await?;
                }
                debug!(
                    "[SyncEngine] Queued bulk rename of {}.{} ({} local row(s))",
                    kind, field, renamed
                );
                Ok(WriteOutcome {
                    entity: None,
                    affected: renamed,
                    queued: true,
                })
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Refresh and replay
    // ─────────────────────────────────────────────────────────────────────────

    /// Reload every configured collection wholesale: from the remote store when
    /// online with nothing pending, from the local mirror otherwise. Pending
    /// mutations are left for the next drain, which refreshes on its own.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.remote_writable_locked().await? {
            match self.refresh_remote_locked().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connectivity() => {
                    warn!("[SyncEngine] Refresh fell back to local: {}", err);
                    self.record_error(&err);
                }
                Err(err) => {
                    self.record_error(&err);
                    return Err(err);
                }
            }
        }
        for kind in &self.config.collections {
            self.local.get(*kind).await?;
        }
        self.update_status(true).await;
        Ok(())
    }

    async fn refresh_remote_locked(&self) -> Result<()> {
        let mut collections = Vec::with_capacity(self.config.collections.len());
        for kind in &self.config.collections {
            let rows = self.remote.select(kind.collection(), &Query::new()).await?;
            collections.push((*kind, rows));
        }
        for (kind, rows) in &collections {
            self.local.put(*kind, rows).await?;
        }
        debug!(
            "[SyncEngine] Refreshed {} collection(s) from remote",
            collections.len()
        );
        self.update_status(true).await;
        Ok(())
    }

    /// Replay the mutation queue and refresh from the remote store.
    ///
    /// Not re-entrant: a trigger that arrives while a drain is in flight returns
    /// [`SyncOutcome::AlreadyRunning`] without doing anything.
    pub async fn synchronize(&self) -> Result<SyncOutcome> {
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("[SyncEngine] Drain already in flight, ignoring trigger");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _syncing = SyncingGuard(&self.syncing);
        let _guard = self.op_lock.lock().await;
        let result = self.drain_and_refresh_locked().await;
        drop(_syncing);
        self.publish(|_| {});
        result
    }

    async fn drain_and_refresh_locked(&self) -> Result<SyncOutcome> {
        if !self.monitor.is_online() {
            return Ok(SyncOutcome::Offline);
        }
        self.publish(|_| {});

        let reconciler = Reconciler::new(
            self.remote.as_ref(),
            &self.local,
            &self.queue,
            self.kv.as_ref(),
            self.config.drain_mode,
        );
        let report = match reconciler.drain().await {
            Ok(report) => report,
            Err(err) => {
                self.record_error(&err);
                self.update_status(true).await;
                return Err(err);
            }
        };

        if let Err(err) = self.refresh_remote_locked().await {
            self.record_error(&err);
            return Err(err);
        }

        let synced_at = Utc::now().to_rfc3339();
        let last_error = (report.discarded > 0).then(|| {
            format!(
                "{} queued mutation(s) were rejected by the remote store and discarded",
                report.discarded
            )
        });
        self.publish(|status| {
            status.last_error = last_error;
            status.last_synced_at = Some(synced_at);
        });
        self.update_status(false).await;
        Ok(SyncOutcome::Completed(report))
    }

    /// Online with an empty queue: the only case in which a write or refresh may
    /// talk to the remote store without overtaking pending mutations.
    async fn remote_writable_locked(&self) -> Result<bool> {
        if !self.monitor.is_online() {
            return Ok(false);
        }
        self.queue.is_empty().await
    }
}
