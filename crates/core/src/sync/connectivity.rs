//! Network reachability tracking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::scheduler::CONNECTIVITY_PROBE_JITTER_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    Offline,
    Online,
}

/// Answers "can the remote store be reached right now?".
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Process-wide connectivity state with change notifications.
///
/// Subscribers get a `watch` receiver: rapid flapping is coalesced and a slow
/// subscriber only ever observes the latest state.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<ConnectivityState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }

    /// Record a new state. Subscribers are notified only on an actual transition.
    pub fn set_state(&self, state: ConnectivityState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            info!("[Connectivity] Now {:?}", state);
        }
        changed
    }

    /// A remote call failed with a transport error. Go offline until the probe
    /// sees the remote again.
    pub fn report_unreachable(&self, reason: &str) {
        if self.set_state(ConnectivityState::Offline) {
            warn!("[Connectivity] Remote unreachable: {}", reason);
        }
    }
}

fn probe_delay(interval: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=CONNECTIVITY_PROBE_JITTER_MS);
    interval + Duration::from_millis(jitter)
}

/// Poll `probe` forever and feed the result into `monitor`.
pub fn spawn_probe_loop(
    monitor: Arc<ConnectivityMonitor>,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let reachable = probe.is_reachable().await;
            debug!("[Connectivity] Probe reachable={}", reachable);
            monitor.set_state(if reachable {
                ConnectivityState::Online
            } else {
                ConnectivityState::Offline
            });
            tokio::time::sleep(probe_delay(interval)).await;
        }
    })
}
