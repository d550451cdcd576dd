use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use crate::config::HeartbeatConfig;
use crate::errors::{Result, SyncError, TransportError};
use crate::metrics::SyncMetrics;
use crate::realtime::bus::EventBus;
use crate::realtime::envelope::Envelope;
use crate::realtime::heartbeat::{Roster, RosterChange};
use crate::realtime::registry::{ChannelRegistry, ChannelSignal};
use crate::realtime::subscription::{Subscription, Watchers};
use crate::realtime::topic::Topic;
use crate::realtime::types::{
    DomainEvent, PlayerJoined, PlayerLeft, PresenceMessage, PresenceRecord, PresenceStatus, SessionId,
};

/// Per-topic presence state shared by every joiner and watcher in the process
struct TopicPresence {
    topic: Topic,
    roster: Mutex<Roster>,
    /// Held from roster change to the end of its fan-out
    dispatch: ReentrantMutex<()>,
    watchers: Watchers<Vec<PresenceRecord>>,
    /// Sessions joined from this process, with their heartbeat tasks
    local: Mutex<HashMap<SessionId, LocalSession>>,
    refs: AtomicUsize,
    feed: Mutex<Option<Subscription>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

struct LocalSession {
    record: PresenceRecord,
    heartbeat: Option<JoinHandle<()>>,
}

impl TopicPresence {
    fn snapshot(&self) -> Vec<PresenceRecord> {
        self.roster.lock().snapshot()
    }

    fn apply(&self, message: &PresenceMessage, ts: DateTime<Utc>, metrics: &SyncMetrics) -> RosterChange {
        let _order = self.dispatch.lock();
        let change = self.roster.lock().apply(message, ts, Instant::now());
        if change.is_visible() {
            self.watchers.emit(&self.snapshot(), metrics);
        }
        change
    }

    fn local_records(&self) -> Vec<PresenceRecord> {
        self.local.lock().values().map(|s| s.record.clone()).collect()
    }

    fn is_local(&self, session_id: &SessionId) -> bool {
        self.local.lock().contains_key(session_id)
    }
}

/// Who is currently in each game, per `presence:{gameId}` topic.
///
/// Joined sessions heartbeat on the topic every `heartbeat.interval`; a
/// session that stays silent for `expiry_multiple` intervals is dropped by a
/// periodic sweep. Subscribers get the full membership on every change,
/// starting with the current membership when they attach.
pub struct PresenceTracker {
    registry: Arc<ChannelRegistry>,
    events: EventBus,
    config: HeartbeatConfig,
    metrics: Arc<SyncMetrics>,
    topics: AsyncMutex<HashMap<Topic, Arc<TopicPresence>>>,
    runtime: Handle,
    this: Weak<PresenceTracker>,
}

impl PresenceTracker {
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        events: EventBus,
        config: HeartbeatConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            registry,
            events,
            config,
            metrics,
            topics: AsyncMutex::new(HashMap::new()),
            runtime: Handle::current(),
            this: this.clone(),
        })
    }

    /// Announce `record` on the game's presence topic and keep it alive.
    ///
    /// `callback` receives the current membership immediately (including the
    /// joining session) and again on every change. Closing the returned
    /// handle sends a leave before the topic is released.
    pub async fn join(
        &self,
        game_id: &str,
        record: PresenceRecord,
        callback: impl Fn(&Vec<PresenceRecord>) + Send + Sync + 'static,
    ) -> Result<PresenceSubscription> {
        let topic = Topic::presence(game_id)?;
        let presence = self.acquire(&topic).await?;
        let session_id = record.session_id.clone();
        {
            let mut local = presence.local.lock();
            if local.contains_key(&session_id) {
                drop(local);
                self.release(presence);
                return Err(SyncError::AlreadyJoined {
                    topic: topic.to_string(),
                    session: session_id.to_string(),
                });
            }
            local.insert(
                session_id.clone(),
                LocalSession {
                    record: record.clone(),
                    heartbeat: None,
                },
            );
        }

        // From here on, dropping the handle (or this future) leaves again
        let (watcher, gate) = presence.watchers.add(Arc::new(callback));
        let leave = self.leave_action(presence.clone(), session_id.clone(), watcher);
        let handle = PresenceSubscription {
            session_id: session_id.clone(),
            presence: presence.clone(),
            tracker: self.this.clone(),
            inner: Subscription::new(topic.clone(), gate).on_close(leave),
        };
        let heartbeat = self.spawn_heartbeat(&presence, session_id.clone());
        if let Some(session) = presence.local.lock().get_mut(&session_id) {
            session.heartbeat = Some(heartbeat);
        }

        let join = PresenceMessage::Join(record.clone());
        {
            let _order = presence.dispatch.lock();
            if !presence.apply(&join, Utc::now(), &self.metrics).is_visible() {
                presence.watchers.emit_to(watcher, &presence.snapshot(), &self.metrics);
            }
        }
        if let Err(e) = self.send(&topic, &join).await {
            log::warn!("join of {} on {} not sent, heartbeats will retry: {}", session_id, topic, e);
        }
        if self.config.announce_events {
            let event = DomainEvent::PlayerJoined(PlayerJoined {
                session_id: session_id.clone(),
                display_name: record.display_name.clone(),
            });
            if let Err(e) = self.events.publish(topic.game_id(), event).await {
                log::warn!("player_joined for {} not announced: {}", session_id, e);
            }
        }

        log::info!("{} joined {}", session_id, topic);
        Ok(handle)
    }

    /// Observe a game's membership without joining it.
    pub async fn watch(
        &self,
        game_id: &str,
        callback: impl Fn(&Vec<PresenceRecord>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.watch_topic(&Topic::presence(game_id)?, callback).await
    }

    pub(crate) async fn watch_topic(
        &self,
        topic: &Topic,
        callback: impl Fn(&Vec<PresenceRecord>) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        topic.expect_kind(crate::realtime::topic::TopicKind::Presence)?;
        let presence = self.acquire(topic).await?;
        let (watcher, gate) = {
            let _order = presence.dispatch.lock();
            let (watcher, gate) = presence.watchers.add(Arc::new(callback));
            presence.watchers.emit_to(watcher, &presence.snapshot(), &self.metrics);
            (watcher, gate)
        };
        let tracker = self.this.clone();
        Ok(Subscription::new(topic.clone(), gate).on_close(move || {
            presence.watchers.remove(watcher);
            if let Some(tracker) = tracker.upgrade() {
                tracker.release(presence);
            }
        }))
    }

    /// Current membership if anyone in this process follows the game.
    pub async fn members(&self, game_id: &str) -> Result<Option<Vec<PresenceRecord>>> {
        let topic = Topic::presence(game_id)?;
        Ok(self.topics.lock().await.get(&topic).map(|p| p.snapshot()))
    }

    /// Stop heartbeats and sweeps everywhere. Leaves are not sent.
    pub async fn shutdown(&self) {
        let mut topics = self.topics.lock().await;
        for (_, presence) in topics.drain() {
            if let Some(sweeper) = presence.sweeper.lock().take() {
                sweeper.abort();
            }
            for session in presence.local.lock().values_mut() {
                if let Some(task) = session.heartbeat.take() {
                    task.abort();
                }
            }
            let feed = presence.feed.lock().take();
            drop(feed);
        }
    }

    async fn send(&self, topic: &Topic, message: &PresenceMessage) -> Result<u64> {
        let envelope = Envelope::presence(topic.clone(), message).map_err(TransportError::from)?;
        self.registry.publish(envelope).await
    }

    async fn acquire(&self, topic: &Topic) -> Result<Arc<TopicPresence>> {
        let mut topics = self.topics.lock().await;
        if let Some(presence) = topics.get(topic) {
            presence.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(presence.clone());
        }

        let presence = Arc::new(TopicPresence {
            topic: topic.clone(),
            roster: Mutex::new(Roster::new()),
            dispatch: ReentrantMutex::new(()),
            watchers: Watchers::new(),
            local: Mutex::new(HashMap::new()),
            refs: AtomicUsize::new(1),
            feed: Mutex::new(None),
            sweeper: Mutex::new(None),
        });
        let feed = self.registry.subscribe(topic, self.feed_handler(&presence)).await?;
        *presence.feed.lock() = Some(feed);
        *presence.sweeper.lock() = Some(self.spawn_sweeper(&presence));
        topics.insert(topic.clone(), presence.clone());
        Ok(presence)
    }

    fn release(&self, presence: Arc<TopicPresence>) {
        if presence.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(tracker) = self.this.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let mut topics = tracker.topics.lock().await;
            if presence.refs.load(Ordering::Acquire) != 0 {
                return;
            }
            if topics.get(&presence.topic).is_some_and(|p| Arc::ptr_eq(p, &presence)) {
                topics.remove(&presence.topic);
            }
            drop(topics);
            if let Some(sweeper) = presence.sweeper.lock().take() {
                sweeper.abort();
            }
            let feed = presence.feed.lock().take();
            drop(feed);
        });
    }

    fn feed_handler(&self, presence: &Arc<TopicPresence>) -> impl Fn(&ChannelSignal) + Send + Sync + 'static {
        let weak = Arc::downgrade(presence);
        let tracker = self.this.clone();
        let metrics = self.metrics.clone();
        move |signal| {
            let (Some(presence), Some(tracker)) = (weak.upgrade(), tracker.upgrade()) else {
                return;
            };
            match signal {
                ChannelSignal::Frame(envelope) => match envelope.decode_presence() {
                    Ok(message) => {
                        let change = presence.apply(&message, envelope.ts, &metrics);
                        let remote_join = matches!(message, PresenceMessage::Join(_))
                            && change == RosterChange::Joined
                            && !presence.is_local(message.session_id());
                        if remote_join {
                            tracker.heartbeat_all(&presence);
                        }
                    }
                    Err(e) => {
                        metrics.record_malformed();
                        log::warn!("dropping presence frame #{} on {}: {}", envelope.seq, presence.topic, e);
                    }
                },
                // Peers on the new carrier have not heard from us yet
                ChannelSignal::Rehomed(_) => tracker.heartbeat_all(&presence),
            }
        }
    }

    /// Send an immediate heartbeat for every local session on the topic.
    fn heartbeat_all(&self, presence: &Arc<TopicPresence>) {
        let records = presence.local_records();
        if records.is_empty() {
            return;
        }
        let Some(tracker) = self.this.upgrade() else {
            return;
        };
        let topic = presence.topic.clone();
        self.runtime.spawn(async move {
            for record in records {
                if let Err(e) = tracker.send(&topic, &PresenceMessage::Heartbeat(record)).await {
                    log::debug!("catch-up heartbeat on {} failed: {}", topic, e);
                }
            }
        });
    }

    fn spawn_heartbeat(&self, presence: &Arc<TopicPresence>, session_id: SessionId) -> JoinHandle<()> {
        let weak = Arc::downgrade(presence);
        let tracker = self.this.clone();
        let period = self.config.interval();
        self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let (Some(presence), Some(tracker)) = (weak.upgrade(), tracker.upgrade()) else {
                    return;
                };
                let Some(record) = presence.local.lock().get(&session_id).map(|s| s.record.clone()) else {
                    return;
                };
                presence.roster.lock().touch(&session_id, Instant::now());
                if let Err(e) = tracker.send(&presence.topic, &PresenceMessage::Heartbeat(record)).await {
                    log::warn!("heartbeat for {} on {} failed: {}", session_id, presence.topic, e);
                }
            }
        })
    }

    fn spawn_sweeper(&self, presence: &Arc<TopicPresence>) -> JoinHandle<()> {
        let weak = Arc::downgrade(presence);
        let metrics = self.metrics.clone();
        let period = self.config.sweep_interval();
        let window = self.config.expiry();
        self.runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(presence) = weak.upgrade() else {
                    return;
                };
                {
                    let _order = presence.dispatch.lock();
                    let expired = {
                        let mut roster = presence.roster.lock();
                        let expired = roster.expire(Instant::now(), window);
                        if let Ok(horizon) = chrono::Duration::from_std(window.saturating_mul(4)) {
                            roster.prune_departed(Utc::now() - horizon);
                        }
                        expired
                    };
                    if !expired.is_empty() {
                        log::info!("expired {} session(s) on {}", expired.len(), presence.topic);
                        presence.watchers.emit(&presence.snapshot(), &metrics);
                    }
                }
            }
        })
    }

    /// Cleanup run when a joined session's handle closes.
    fn leave_action(&self, presence: Arc<TopicPresence>, session_id: SessionId, watcher: u64) -> impl FnOnce() + Send + 'static {
        let tracker = self.this.clone();
        let metrics = self.metrics.clone();
        let announce = self.config.announce_events;
        move || {
            presence.watchers.remove(watcher);
            if let Some(LocalSession { heartbeat: Some(task), .. }) = presence.local.lock().remove(&session_id) {
                task.abort();
            }
            let leave = PresenceMessage::Leave(session_id.clone());
            presence.apply(&leave, Utc::now(), &metrics);

            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            let runtime = tracker.runtime.clone();
            runtime.spawn(async move {
                if let Err(e) = tracker.send(&presence.topic, &leave).await {
                    log::warn!("leave of {} on {} not sent: {}", session_id, presence.topic, e);
                }
                if announce {
                    let event = DomainEvent::PlayerLeft(PlayerLeft {
                        session_id: session_id.clone(),
                    });
                    if let Err(e) = tracker.events.publish(presence.topic.game_id(), event).await {
                        log::debug!("player_left for {} not announced: {}", session_id, e);
                    }
                }
                log::info!("{} left {}", session_id, presence.topic);
                tracker.release(presence);
            });
        }
    }
}

/// Handle on a joined session.
///
/// Dropping it leaves the game, like [`PresenceSubscription::close`].
pub struct PresenceSubscription {
    session_id: SessionId,
    presence: Arc<TopicPresence>,
    tracker: Weak<PresenceTracker>,
    inner: Subscription,
}

impl PresenceSubscription {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn topic(&self) -> &Topic {
        self.inner.topic()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    pub fn members(&self) -> Vec<PresenceRecord> {
        self.presence.snapshot()
    }

    /// Change this session's status and broadcast it right away.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<()> {
        if !self.is_active() {
            return Err(SyncError::Unavailable(self.topic().to_string()));
        }
        let tracker = self.tracker.upgrade().ok_or(SyncError::ShutDown)?;
        let record = {
            let mut local = self.presence.local.lock();
            let Some(session) = local.get_mut(&self.session_id) else {
                return Err(SyncError::Unavailable(self.topic().to_string()));
            };
            session.record.status = status;
            session.record.clone()
        };
        let heartbeat = PresenceMessage::Heartbeat(record);
        self.presence.apply(&heartbeat, Utc::now(), &tracker.metrics);
        tracker.send(&self.presence.topic, &heartbeat).await?;
        Ok(())
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for PresenceSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceSubscription")
            .field("session_id", &self.session_id)
            .field("topic", &self.topic().to_string())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::transport::{Link, LinkSender, LocalBus, Transport, TransportKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct Fixture {
        bus: Arc<LocalBus>,
        tracker: Arc<PresenceTracker>,
    }

    fn tracker_on(transport: Arc<dyn Transport>, announce: bool) -> Arc<PresenceTracker> {
        let metrics = Arc::new(SyncMetrics::new());
        let (registry, _) = ChannelRegistry::new(None, transport, metrics.clone(), Duration::from_millis(20));
        let events = EventBus::new(registry.clone(), metrics.clone());
        let config = HeartbeatConfig {
            interval_ms: 10_000,
            announce_events: announce,
            ..HeartbeatConfig::default()
        };
        PresenceTracker::new(registry, events, config, metrics)
    }

    fn fixture(bus: Arc<LocalBus>, announce: bool) -> Fixture {
        Fixture {
            tracker: tracker_on(bus.clone(), announce),
            bus,
        }
    }

    /// The bus, except that the first publish never completes.
    struct StallingBus {
        bus: Arc<LocalBus>,
        stall: Arc<AtomicBool>,
    }

    struct StallingSender {
        inner: Arc<dyn LinkSender>,
        stall: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LinkSender for StallingSender {
        async fn send(&self, envelope: Envelope) -> std::result::Result<u64, TransportError> {
            if self.stall.swap(false, Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.send(envelope).await
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[async_trait]
    impl Transport for StallingBus {
        fn kind(&self) -> TransportKind {
            TransportKind::Fallback
        }

        async fn open(&self, topic: &Topic) -> std::result::Result<Link, TransportError> {
            let mut link = self.bus.open(topic).await?;
            let inbound = link.take_inbound().unwrap();
            let sender = Arc::new(StallingSender {
                inner: link.sender(),
                stall: self.stall.clone(),
            });
            Ok(Link::new(topic.clone(), TransportKind::Fallback, sender, inbound))
        }
    }

    fn latest() -> (Arc<Mutex<Vec<Vec<PresenceRecord>>>>, impl Fn(&Vec<PresenceRecord>) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |s: &Vec<PresenceRecord>| sink.lock().push(s.clone()))
    }

    fn names(snapshot: &[PresenceRecord]) -> Vec<String> {
        snapshot.iter().map(|r| r.display_name.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_sees_itself_immediately() {
        let f = fixture(LocalBus::new(64), false);
        let (seen, cb) = latest();
        let sub = f
            .tracker
            .join("snake", PresenceRecord::new("b".into(), "B"), cb)
            .await
            .unwrap();
        assert_eq!(names(&seen.lock()[0]), vec!["B"]);
        assert_eq!(names(&sub.members()), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_expires_while_heartbeating_one_stays() {
        let f = fixture(LocalBus::new(64), false);
        let topic = Topic::presence("snake").unwrap();
        let (seen, cb) = latest();
        let _watch = f.tracker.watch("snake", cb).await.unwrap();

        // A joins from elsewhere and then goes silent
        let a = PresenceRecord::new("a".into(), "A");
        f.bus
            .publish(Envelope::presence(topic.clone(), &PresenceMessage::Join(a)).unwrap());
        let _b = f
            .tracker
            .join("snake", PresenceRecord::new("b".into(), "B"), |_| {})
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(names(seen.lock().last().unwrap()), vec!["A", "B"]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(names(seen.lock().last().unwrap()), vec!["B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_reaches_other_processes() {
        let bus = LocalBus::new(64);
        let here = fixture(bus.clone(), false);
        let there = fixture(bus, false);
        let (seen, cb) = latest();
        let _watch = there.tracker.watch("snake", cb).await.unwrap();

        let mut sub = here
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(names(seen.lock().last().unwrap()), vec!["A"]);

        sub.close();
        assert!(!sub.is_active());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().last().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_learns_existing_members_promptly() {
        let bus = LocalBus::new(64);
        let first = fixture(bus.clone(), false);
        let second = fixture(bus, false);
        let _a = first
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (seen, cb) = latest();
        let _b = second
            .tracker
            .join("snake", PresenceRecord::new("b".into(), "B"), cb)
            .await
            .unwrap();
        // Well before A's next scheduled heartbeat
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut members = names(seen.lock().last().unwrap());
        members.sort();
        assert_eq!(members, vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn status_changes_are_broadcast() {
        let bus = LocalBus::new(64);
        let here = fixture(bus.clone(), false);
        let there = fixture(bus, false);
        let (seen, cb) = latest();
        let _watch = there.tracker.watch("snake", cb).await.unwrap();
        let sub = here
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await
            .unwrap();
        sub.set_status(PresenceStatus::Playing).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(seen.lock().last().unwrap()[0].status, PresenceStatus::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn joining_twice_is_rejected() {
        let f = fixture(LocalBus::new(64), false);
        let _a = f
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await
            .unwrap();
        let again = f
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await;
        assert!(matches!(again, Err(SyncError::AlreadyJoined { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn joins_and_leaves_are_announced_as_events() {
        let f = fixture(LocalBus::new(64), true);
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let sink = kinds.clone();
        let _events = f
            .tracker
            .events
            .subscribe("snake", move |m| {
                if let crate::realtime::bus::BusMessage::Event(e) = m {
                    sink.lock().push(e.event.kind());
                }
            })
            .await
            .unwrap();
        let mut sub = f
            .tracker
            .join("snake", PresenceRecord::new("a".into(), "A"), |_| {})
            .await
            .unwrap();
        sub.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*kinds.lock(), vec!["player_joined", "player_left"]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_join_leaves_nothing_behind() {
        let bus = LocalBus::new(64);
        let other = fixture(bus.clone(), false);
        let (seen, cb) = latest();
        let _watch = other.tracker.watch("snake", cb).await.unwrap();

        let stalling = Arc::new(StallingBus {
            bus: bus.clone(),
            stall: Arc::new(AtomicBool::new(true)),
        });
        let ghost = tracker_on(stalling, false);
        let abandoned = tokio::time::timeout(
            Duration::from_secs(1),
            ghost.join("snake", PresenceRecord::new("ghost".into(), "Ghost"), |_| {}),
        )
        .await;
        assert!(abandoned.is_err());

        // A later join asks everyone on the topic to re-announce
        let _b = other
            .tracker
            .join("snake", PresenceRecord::new("b".into(), "B"), |_| {})
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(names(seen.lock().last().unwrap()), vec!["B"]);
        assert!(ghost.members("snake").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_changes_reach_watchers_in_order() {
        let f = fixture(LocalBus::new(64), false);
        let topic = Topic::presence("snake").unwrap();
        let (seen, cb) = latest();
        let _watch = f.tracker.watch("snake", cb).await.unwrap();
        let presence = f.tracker.acquire(&topic).await.unwrap();
        let metrics = Arc::new(SyncMetrics::new());

        let writers: Vec<_> = (0..8)
            .map(|t| {
                let presence = presence.clone();
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let record = PresenceRecord::new(format!("p{t}-{i}").as_str().into(), format!("P{t}-{i}"));
                        presence.apply(&PresenceMessage::Join(record), Utc::now(), &metrics);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        // No snapshot is overtaken by an older, smaller one
        let sizes: Vec<usize> = seen.lock().iter().map(Vec::len).collect();
        assert!(sizes.windows(2).all(|w| w[0] < w[1]), "{sizes:?}");
        assert_eq!(sizes.last(), Some(&200));
        f.tracker.release(presence);
    }
}
