use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::errors::{Result, StoreError};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::realtime::bus::{BusMessage, EventBus, SequencedEvent};
use crate::realtime::failover::{ConnectionState, FailoverManager};
use crate::realtime::leaderboard::LeaderboardService;
use crate::realtime::presence::PresenceTracker;
use crate::realtime::registry::{ChannelRegistry, TopicStats};
use crate::realtime::sequence::SequenceGap;
use crate::realtime::subscription::Subscription;
use crate::realtime::topic::{Topic, TopicKind};
use crate::realtime::transport::{LocalBus, Transport, WsTransport};
use crate::realtime::types::{
    DomainEvent, LeaderboardSnapshot, PresenceRecord, ScoreEntry, ScoreSubmission, ScoreSubmitted, SessionId,
};
use crate::store::{HttpScoreStore, MemoryScoreStore, ScoreStore};

/// Anything a [`RealtimeHub::subscribe`] callback can receive.
#[derive(Clone, Debug, PartialEq)]
pub enum TopicUpdate {
    Event(SequencedEvent),
    Gap(SequenceGap),
    Presence(Vec<PresenceRecord>),
    Leaderboard(LeaderboardSnapshot),
}

/// Optional collaborators for [`RealtimeHub`].
pub struct HubBuilder {
    config: SyncConfig,
    local: Option<Arc<LocalBus>>,
    store: Option<Arc<dyn ScoreStore>>,
}

impl HubBuilder {
    /// Use an existing in-process bus, e.g. to let several hubs in one
    /// process see each other while on fallback.
    pub fn local_bus(mut self, bus: Arc<LocalBus>) -> Self {
        self.local = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn ScoreStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the hub and wait for the first connection attempt to settle.
    pub async fn start(self) -> Result<RealtimeHub> {
        let config = self.config;
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new());
        let local = self
            .local
            .unwrap_or_else(|| LocalBus::new(config.transport.channel_capacity));
        let live = match &config.backend_url {
            Some(url) => Some(Arc::new(WsTransport::new(url, config.transport.clone())?) as Arc<dyn Transport>),
            None => None,
        };
        let store: Arc<dyn ScoreStore> = match (self.store, &config.store.base_url) {
            (Some(store), _) => store,
            (None, Some(url)) => Arc::new(HttpScoreStore::new(url, &config.store)?),
            (None, None) => Arc::new(MemoryScoreStore::new()),
        };

        let (registry, reports) = ChannelRegistry::new(
            live,
            local.clone(),
            metrics.clone(),
            config.transport.publish_retry_wait(),
        );
        let failover = FailoverManager::start(registry.clone(), config.backoff.clone(), reports);
        failover.settled().await;

        let events = EventBus::new(registry.clone(), metrics.clone());
        let presence = PresenceTracker::new(registry.clone(), events.clone(), config.heartbeat.clone(), metrics.clone());
        let leaderboards = LeaderboardService::new(
            events.clone(),
            store.clone(),
            config.leaderboard.clone(),
            config.store.timeout(),
            metrics.clone(),
        );
        let reconcile = spawn_reconcile(failover.watch(), leaderboards.clone());

        log::info!(
            "realtime hub started ({}, state {:?})",
            config.backend_url.as_deref().unwrap_or("no backend"),
            failover.state()
        );
        Ok(RealtimeHub {
            config,
            metrics,
            local,
            registry,
            events,
            presence,
            leaderboards,
            store,
            failover,
            reconcile: Mutex::new(Some(reconcile)),
        })
    }
}

/// Refresh every leaderboard whenever the hub gets back onto the backend.
fn spawn_reconcile(mut state: watch::Receiver<ConnectionState>, leaderboards: Arc<LeaderboardService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            if connected {
                leaderboards.refresh_all().await;
            }
        }
    })
}

/// Entry point of the sync layer for one browser/game process.
///
/// ```no_run
/// # async fn demo() -> arcade_sync::Result<()> {
/// use arcade_sync::{RealtimeHub, SyncConfig, Topic, TopicUpdate, Period};
///
/// let hub = RealtimeHub::start(SyncConfig::with_backend("ws://127.0.0.1:9400")).await?;
/// let _board = hub
///     .subscribe(&Topic::leaderboard("snake", Period::Daily)?, |update| {
///         if let TopicUpdate::Leaderboard(snapshot) = update {
///             println!("{} entries", snapshot.entries.len());
///         }
///     })
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RealtimeHub {
    config: SyncConfig,
    metrics: Arc<SyncMetrics>,
    local: Arc<LocalBus>,
    registry: Arc<ChannelRegistry>,
    events: EventBus,
    presence: Arc<PresenceTracker>,
    leaderboards: Arc<LeaderboardService>,
    store: Arc<dyn ScoreStore>,
    failover: FailoverManager,
    reconcile: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeHub {
    pub fn builder(config: SyncConfig) -> HubBuilder {
        HubBuilder {
            config,
            local: None,
            store: None,
        }
    }

    pub async fn start(config: SyncConfig) -> Result<Self> {
        Self::builder(config).start().await
    }

    /// Subscribe to any topic. Presence topics are watched without joining;
    /// use [`RealtimeHub::presence`] to announce a session.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        callback: impl Fn(&TopicUpdate) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        match topic {
            Topic::Events(_) => {
                self.events
                    .subscribe_to(topic, move |message| match message {
                        BusMessage::Event(event) => callback(&TopicUpdate::Event(event.clone())),
                        BusMessage::Gap(gap) => callback(&TopicUpdate::Gap(gap.clone())),
                    })
                    .await
            }
            Topic::Presence(_) => {
                self.presence
                    .watch_topic(topic, move |members| callback(&TopicUpdate::Presence(members.clone())))
                    .await
            }
            Topic::Leaderboard(game_id, period) => {
                self.leaderboards
                    .subscribe(game_id, *period, move |snapshot| {
                        callback(&TopicUpdate::Leaderboard(snapshot.clone()))
                    })
                    .await
            }
        }
    }

    /// Publish a domain event on an `events:` topic.
    pub async fn publish(&self, topic: &Topic, event: DomainEvent) -> Result<u64> {
        topic.expect_kind(TopicKind::Events)?;
        self.events.publish_to(topic, event).await
    }

    /// Store a score, then announce it on the game's event topic.
    ///
    /// Store failures are returned. A failed announcement is only logged:
    /// the score is stored and leaderboards pick it up on their next refresh.
    pub async fn submit_score(&self, game_id: &str, submission: ScoreSubmission) -> Result<ScoreEntry> {
        let topic = Topic::events(game_id)?;
        let entry = tokio::time::timeout(self.config.store.timeout(), self.store.save_score(game_id, &submission))
            .await
            .map_err(|_| StoreError::Timeout)??;
        let mut event = ScoreSubmitted::from(submission);
        event.submitted_at = Some(entry.submitted_at);
        if let Err(e) = self.events.publish_to(&topic, DomainEvent::ScoreSubmitted(event)).await {
            log::warn!("score for {} stored but not announced: {}", game_id, e);
        }
        Ok(entry)
    }

    pub async fn personal_best(&self, game_id: &str, session_id: &SessionId) -> Result<Option<ScoreEntry>> {
        Topic::events(game_id)?;
        let best = tokio::time::timeout(self.config.store.timeout(), self.store.get_personal_best(game_id, session_id))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(best)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn leaderboards(&self) -> &Arc<LeaderboardService> {
        &self.leaderboards
    }

    pub fn local_bus(&self) -> &Arc<LocalBus> {
        &self.local
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.failover.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.failover.watch()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn topic_stats(&self) -> Vec<TopicStats> {
        self.registry.topic_stats().await
    }

    /// Stop supervision and close every link. Open subscriptions stay valid
    /// handles but receive nothing further.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reconcile.lock().take() {
            task.abort();
        }
        self.failover.shutdown();
        self.leaderboards.shutdown().await;
        self.presence.shutdown().await;
        self.registry.shutdown().await;
        log::info!("realtime hub stopped");
    }
}

impl Drop for RealtimeHub {
    fn drop(&mut self) {
        if let Some(task) = self.reconcile.lock().take() {
            task.abort();
        }
    }
}
