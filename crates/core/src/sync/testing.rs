//! In-memory remote store and engine harness for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Notify, Semaphore};

use crate::config::SyncConfig;
use crate::entities::{Entity, EntityId, Payload};
use crate::errors::{Error, Result};

use super::connectivity::{ConnectivityMonitor, ConnectivityState, ReachabilityProbe};
use super::engine::SyncEngine;
use super::model::SyncStatus;
use super::persistence::InMemoryKeyValueStore;
use super::query::{Query, Target};
use super::remote::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Select,
    Insert,
    Update,
    Delete,
}

/// One call received by the fake, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Select {
        collection: String,
    },
    Insert {
        collection: String,
        row: Payload,
    },
    Update {
        collection: String,
        target: Target,
        patch: Payload,
    },
    Delete {
        collection: String,
        target: Target,
    },
}

impl RemoteCall {
    pub fn op(&self) -> RemoteOp {
        match self {
            Self::Select { .. } => RemoteOp::Select,
            Self::Insert { .. } => RemoteOp::Insert,
            Self::Update { .. } => RemoteOp::Update,
            Self::Delete { .. } => RemoteOp::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Connectivity,
    Rejected(u16),
}

impl Failure {
    fn to_error(self) -> Error {
        match self {
            Self::Connectivity => Error::connectivity("connection reset by peer"),
            Self::Rejected(status) => Error::rejected(status, "violates check constraint"),
        }
    }
}

struct Injected {
    op: RemoteOp,
    remaining_successes: usize,
    failure: Failure,
}

#[derive(Default)]
struct FakeState {
    tables: HashMap<String, Vec<Entity>>,
    next_id: u64,
    calls: Vec<RemoteCall>,
    injected: Vec<Injected>,
    unreachable: bool,
}

/// Relational store double: keeps tables in memory, records every call and can
/// be told to fail or stall specific operations.
#[derive(Default)]
pub struct FakeRemoteStore {
    state: Mutex<FakeState>,
    insert_gate: Mutex<Option<Arc<Semaphore>>>,
    insert_waiting: Notify,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake remote state poisoned")
    }

    pub fn seed(&self, collection: &str, rows: Vec<Entity>) {
        let mut state = self.lock();
        state.next_id += rows.len() as u64;
        state.tables.insert(collection.to_string(), rows);
    }

    pub fn rows(&self, collection: &str) -> Vec<Entity> {
        self.lock().tables.get(collection).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    /// Calls other than `select`, which every refresh issues.
    pub fn mutating_calls(&self) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.op() != RemoteOp::Select)
            .collect()
    }

    pub fn count(&self, op: RemoteOp) -> usize {
        self.lock().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Let `op` succeed `successes` more times, then fail once with `failure`.
    pub fn fail_after(&self, op: RemoteOp, successes: usize, failure: Failure) {
        self.lock().injected.push(Injected {
            op,
            remaining_successes: successes,
            failure,
        });
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Hold every insert until a permit is added to the returned semaphore.
    pub fn block_inserts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.insert_gate.lock().expect("gate poisoned") = Some(gate.clone());
        gate
    }

    /// Resolves once an insert is parked on the gate.
    pub async fn insert_blocked(&self) {
        self.insert_waiting.notified().await;
    }

    fn begin(&self, call: RemoteCall) -> Result<()> {
        let mut state = self.lock();
        let op = call.op();
        state.calls.push(call);
        if state.unreachable {
            return Err(Failure::Connectivity.to_error());
        }
        let position = state.injected.iter().position(|i| i.op == op);
        if let Some(position) = position {
            if state.injected[position].remaining_successes == 0 {
                let injected = state.injected.remove(position);
                return Err(injected.failure.to_error());
            }
            state.injected[position].remaining_successes -= 1;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemoteStore {
    async fn select(&self, collection: &str, query: &Query) -> Result<Vec<Entity>> {
        self.begin(RemoteCall::Select {
            collection: collection.to_string(),
        })?;
        Ok(query.apply(self.rows(collection)))
    }

    async fn insert(&self, collection: &str, row: Payload) -> Result<Entity> {
        let gate = self.insert_gate.lock().expect("gate poisoned").clone();
        if let Some(gate) = gate {
            self.insert_waiting.notify_one();
            gate.acquire().await.expect("gate closed").forget();
        }
        self.begin(RemoteCall::Insert {
            collection: collection.to_string(),
            row: row.clone(),
        })?;

        let mut state = self.lock();
        state.next_id += 1;
        let entity = Entity::new(EntityId::new(format!("srv-{}", state.next_id)), row);
        state
            .tables
            .entry(collection.to_string())
            .or_default()
            .push(entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        collection: &str,
        target: &Target,
        patch: Payload,
    ) -> Result<Vec<Entity>> {
        self.begin(RemoteCall::Update {
            collection: collection.to_string(),
            target: target.clone(),
            patch: patch.clone(),
        })?;

        let mut state = self.lock();
        let rows = state.tables.entry(collection.to_string()).or_default();
        let mut updated = Vec::new();
        for row in rows.iter_mut().filter(|row| target.matches(row)) {
            row.apply_patch(&patch);
            updated.push(row.clone());
        }
        Ok(updated)
    }

    async fn delete(&self, collection: &str, target: &Target) -> Result<()> {
        self.begin(RemoteCall::Delete {
            collection: collection.to_string(),
            target: target.clone(),
        })?;

        let mut state = self.lock();
        if let Some(rows) = state.tables.get_mut(collection) {
            rows.retain(|row| !target.matches(row));
        }
        Ok(())
    }
}

/// Reachability answer that tests flip by hand.
#[derive(Default)]
pub struct SwitchProbe(AtomicBool);

impl SwitchProbe {
    pub fn new(reachable: bool) -> Self {
        Self(AtomicBool::new(reachable))
    }

    pub fn set(&self, reachable: bool) {
        self.0.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityProbe for SwitchProbe {
    async fn is_reachable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be an object")
}

pub fn entity(id: &str, value: Value) -> Entity {
    Entity::new(EntityId::new(id), payload(value))
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub remote: Arc<FakeRemoteStore>,
    pub kv: Arc<InMemoryKeyValueStore>,
    pub monitor: Arc<ConnectivityMonitor>,
}

impl Harness {
    pub fn new(state: ConnectivityState) -> Self {
        Self::with_config(SyncConfig::default(), state)
    }

    pub fn with_config(config: SyncConfig, state: ConnectivityState) -> Self {
        let remote = Arc::new(FakeRemoteStore::new());
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let monitor = Arc::new(ConnectivityMonitor::new(state));
        let engine = Arc::new(SyncEngine::new(
            config,
            remote.clone(),
            kv.clone(),
            monitor.clone(),
        ));
        Self {
            engine,
            remote,
            kv,
            monitor,
        }
    }

    /// A second engine over the same persisted state, as after a process restart.
    pub fn restart(&self, config: SyncConfig) -> Arc<SyncEngine> {
        Arc::new(SyncEngine::new(
            config,
            self.remote.clone(),
            self.kv.clone(),
            self.monitor.clone(),
        ))
    }
}

/// Wait until the engine publishes a status satisfying `predicate`.
pub async fn wait_for_status(
    engine: &SyncEngine,
    predicate: impl Fn(&SyncStatus) -> bool,
) -> SyncStatus {
    let mut rx: watch::Receiver<SyncStatus> = engine.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let status = rx.borrow_and_update();
                if predicate(&status) {
                    return status.clone();
                }
            }
            rx.changed().await.expect("engine dropped");
        }
    })
    .await
    .expect("timed out waiting for engine status")
}
