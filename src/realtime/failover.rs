use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::BackoffConfig;
use crate::realtime::registry::{ChannelRegistry, FailureReport};
use crate::realtime::transport::TransportKind;

/// Connectivity of the hub as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Every topic runs on the live backend.
    Connected,
    /// The live backend just failed; topics are being moved to fallback.
    Disconnected,
    /// Running on fallback while retrying the backend with backoff.
    Reconnecting { attempt: u32 },
    /// Running on fallback; the backend is probed occasionally.
    Fallback,
}

struct Shared {
    registry: Arc<ChannelRegistry>,
    config: BackoffConfig,
    state: watch::Sender<ConnectionState>,
    /// Reports raised before this instant describe links already replaced
    last_switch: Mutex<Option<Instant>>,
}

impl Shared {
    fn set(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::info!("connection state: {:?}", next);
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Probe the backend and move every topic onto it.
    async fn try_live(&self) -> bool {
        if let Err(e) = self.registry.probe_live().await {
            log::debug!("backend probe failed: {}", e);
            return false;
        }
        match self.registry.switch_to(TransportKind::Live).await {
            Ok(moved) => {
                *self.last_switch.lock() = Some(Instant::now());
                self.set(ConnectionState::Connected);
                log::info!("backend reachable, {} topic(s) back on live", moved);
                true
            }
            Err(e) => {
                log::warn!("backend answered the probe but re-homing failed: {}", e);
                // Undo the topics that did move
                if let Err(e) = self.registry.switch_to(TransportKind::Fallback).await {
                    log::error!("returning topics to fallback failed: {}", e);
                }
                false
            }
        }
    }

    fn is_stale(&self, report: &FailureReport) -> bool {
        self.last_switch.lock().is_some_and(|at| report.at < at)
    }

    /// Retry the backend with backoff, then settle in fallback and keep
    /// probing until it answers.
    async fn recover(&self) {
        let started = Instant::now();
        let budget = self.config.max_retry_duration();
        let mut attempt = 0;
        while attempt < self.config.max_attempts && started.elapsed() < budget {
            attempt += 1;
            self.set(ConnectionState::Reconnecting { attempt });
            let delay = self.config.delay(attempt, jitter_sample());
            log::debug!("reconnect attempt {} in {:?}", attempt, delay);
            sleep(delay).await;
            if self.try_live().await {
                return;
            }
        }

        log::warn!(
            "backend unreachable after {} attempt(s) in {:?}, staying on fallback",
            attempt,
            started.elapsed()
        );
        self.set(ConnectionState::Fallback);
        loop {
            sleep(self.config.probe_interval()).await;
            if self.try_live().await {
                return;
            }
        }
    }

    async fn supervise(self: Arc<Self>, mut reports: mpsc::UnboundedReceiver<FailureReport>) {
        if !self.try_live().await {
            self.recover().await;
        }
        while let Some(report) = reports.recv().await {
            if self.is_stale(&report) || self.current() != ConnectionState::Connected {
                continue;
            }
            log::warn!("live link for {} failed: {}", report.topic, report.reason);
            self.set(ConnectionState::Disconnected);
            if let Err(e) = self.registry.switch_to(TransportKind::Fallback).await {
                log::error!("moving topics to fallback failed: {}", e);
            }
            self.recover().await;
        }
    }
}

fn jitter_sample() -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
}

/// Keeps the registry on the best available transport.
///
/// Watches failure reports from live links. On the first failure while
/// connected it moves every topic to the fallback transport, then retries
/// the backend with exponential backoff; once retries run out it stays on
/// fallback and probes every `probe_interval`. When the backend answers,
/// every topic moves back and the state returns to
/// [`ConnectionState::Connected`].
pub struct FailoverManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverManager {
    /// Start supervising `registry`. Without a live transport the manager
    /// settles in [`ConnectionState::Fallback`] and never probes.
    pub fn start(
        registry: Arc<ChannelRegistry>,
        config: BackoffConfig,
        reports: mpsc::UnboundedReceiver<FailureReport>,
    ) -> Self {
        let has_live = registry.has_live();
        let initial = if has_live {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Fallback
        };
        let (state, _) = watch::channel(initial);
        let shared = Arc::new(Shared {
            registry,
            config,
            state,
            last_switch: Mutex::new(None),
        });
        let task = has_live.then(|| tokio::spawn(shared.clone().supervise(reports)));
        Self {
            shared,
            task: Mutex::new(task),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the first connection attempt settled, one way or the other.
    pub async fn settled(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|s| *s != ConnectionState::Disconnected).await;
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for FailoverManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
