use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::{ReentrantMutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::errors::{Result, SyncError, TransportError};
use crate::metrics::SyncMetrics;
use crate::realtime::envelope::Envelope;
use crate::realtime::subscription::{Subscription, Watchers};
use crate::realtime::topic::Topic;
use crate::realtime::transport::{Link, LinkSender, Transport, TransportKind};

/// What a channel hands to its subscribers.
#[derive(Clone, Debug)]
pub enum ChannelSignal {
    Frame(Envelope),
    /// The topic now runs on another transport; numbering restarts there.
    Rehomed(TransportKind),
}

/// A link that failed underneath the registry.
#[derive(Clone, Debug)]
pub struct FailureReport {
    pub topic: Topic,
    pub kind: TransportKind,
    pub reason: String,
    pub at: Instant,
}

/// Statistics for one open topic
#[derive(Clone, Debug, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub subscribers: usize,
    pub references: usize,
    pub transport: Option<TransportKind>,
    pub delivered: u64,
}

struct ActiveLink {
    kind: TransportKind,
    sender: Arc<dyn LinkSender>,
    pump: JoinHandle<()>,
}

impl ActiveLink {
    fn shut(self) {
        self.pump.abort();
        self.sender.close();
    }
}

struct TopicChannel {
    topic: Topic,
    slots: Watchers<ChannelSignal>,
    refs: AtomicUsize,
    /// Bumped on every link change; pumps of older generations go quiet
    generation: AtomicU64,
    dispatch: ReentrantMutex<()>,
    link: RwLock<Option<ActiveLink>>,
    relinked: Notify,
    delivered: AtomicU64,
}

impl TopicChannel {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            slots: Watchers::new(),
            refs: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            dispatch: ReentrantMutex::new(()),
            link: RwLock::new(None),
            relinked: Notify::new(),
            delivered: AtomicU64::new(0),
        }
    }

    /// Deliver a frame from the pump of `generation`; false once superseded.
    fn deliver(&self, generation: u64, envelope: Envelope, metrics: &SyncMetrics) -> bool {
        let _order = self.dispatch.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.slots.emit(&ChannelSignal::Frame(envelope), metrics);
        true
    }

    fn current_sender(&self) -> Option<(Arc<dyn LinkSender>, TransportKind, u64)> {
        let generation = self.generation.load(Ordering::Acquire);
        self.link
            .read()
            .as_ref()
            .map(|l| (l.sender.clone(), l.kind, generation))
    }

    fn transport_kind(&self) -> Option<TransportKind> {
        self.link.read().as_ref().map(|l| l.kind)
    }
}

/// Keeps a channel open for one publish, including one that is abandoned.
struct Hold<'a> {
    registry: &'a ChannelRegistry,
    channel: Option<Arc<TopicChannel>>,
}

impl Drop for Hold<'_> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.registry.release(channel);
        }
    }
}

/// Owns every open topic: one link per topic, shared by all subscribers.
///
/// Links are reference counted. The first subscriber opens the topic on the
/// active transport, the last one to leave closes it. Acquire, release and
/// re-homing are serialized by one async lock so a release can never race a
/// concurrent acquire into closing a link that just gained a user.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<Topic, Arc<TopicChannel>>>,
    live: Option<Arc<dyn Transport>>,
    fallback: Arc<dyn Transport>,
    active: RwLock<TransportKind>,
    failures: mpsc::UnboundedSender<FailureReport>,
    metrics: Arc<SyncMetrics>,
    runtime: Handle,
    next_generation: AtomicU64,
    publish_retry_wait: Duration,
    closed: AtomicBool,
    this: Weak<ChannelRegistry>,
}

impl ChannelRegistry {
    /// Must be called from within a tokio runtime.
    pub fn new(
        live: Option<Arc<dyn Transport>>,
        fallback: Arc<dyn Transport>,
        metrics: Arc<SyncMetrics>,
        publish_retry_wait: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FailureReport>) {
        let (failures, reports) = mpsc::unbounded_channel();
        let registry = Arc::new_cyclic(|this| Self {
            channels: Mutex::new(HashMap::new()),
            live,
            fallback,
            active: RwLock::new(TransportKind::Fallback),
            failures,
            metrics,
            runtime: Handle::current(),
            next_generation: AtomicU64::new(1),
            publish_retry_wait,
            closed: AtomicBool::new(false),
            this: this.clone(),
        });
        (registry, reports)
    }

    pub fn active_kind(&self) -> TransportKind {
        *self.active.read()
    }

    pub fn has_live(&self) -> bool {
        self.live.is_some()
    }

    fn transport(&self, kind: TransportKind) -> std::result::Result<&Arc<dyn Transport>, TransportError> {
        match kind {
            TransportKind::Live => self.live.as_ref().ok_or(TransportError::NotConfigured),
            TransportKind::Fallback => Ok(&self.fallback),
        }
    }

    pub async fn probe_live(&self) -> std::result::Result<(), TransportError> {
        self.transport(TransportKind::Live)?.probe().await
    }

    /// Register `callback` for every signal on `topic`.
    ///
    /// Frames published before this call are not replayed.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        callback: impl Fn(&ChannelSignal) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let channel = self.acquire(topic).await?;
        let (slot, gate) = channel.slots.add(Arc::new(callback));
        let registry = self.this.clone();
        Ok(Subscription::new(topic.clone(), gate).on_close(move || {
            channel.slots.remove(slot);
            if let Some(registry) = registry.upgrade() {
                registry.release(channel);
            }
        }))
    }

    /// Publish on `topic` and return the assigned sequence number.
    ///
    /// Works without subscribers: the topic is held open for the duration of
    /// the call. A failed send waits briefly for the topic to be re-homed and
    /// retries once.
    pub async fn publish(&self, envelope: Envelope) -> Result<u64> {
        let channel = self.acquire(&envelope.topic).await?;
        let hold = Hold {
            registry: self,
            channel: Some(channel.clone()),
        };
        let outcome = self.send_on(&channel, envelope).await;
        drop(hold);
        if outcome.is_ok() {
            self.metrics.record_published();
        }
        outcome
    }

    async fn send_on(&self, channel: &Arc<TopicChannel>, envelope: Envelope) -> Result<u64> {
        let relinked = channel.relinked.notified();
        tokio::pin!(relinked);
        relinked.as_mut().enable();

        let Some((sender, kind, generation)) = channel.current_sender() else {
            return Err(SyncError::Unavailable(channel.topic.to_string()));
        };
        let first_error = match sender.send(envelope.clone()).await {
            Ok(seq) => return Ok(seq),
            // The frame may have gone out; a resend could duplicate it
            Err(e @ TransportError::AckTimeout(_)) => {
                log::warn!("publish on {} via {} unconfirmed: {}", channel.topic, kind, e);
                return Err(e.into());
            }
            Err(e) => e,
        };
        log::warn!("publish on {} via {} failed: {}", channel.topic, kind, first_error);
        self.report(&channel.topic, kind, &first_error);

        if channel.generation.load(Ordering::Acquire) == generation {
            let _ = tokio::time::timeout(self.publish_retry_wait, relinked).await;
        }
        let Some((sender, kind, _)) = channel.current_sender() else {
            return Err(SyncError::Unavailable(channel.topic.to_string()));
        };
        sender.send(envelope).await.map_err(|e| {
            log::warn!("publish retry on {} via {} failed: {}", channel.topic, kind, e);
            self.report(&channel.topic, kind, &e);
            SyncError::Unavailable(channel.topic.to_string())
        })
    }

    /// Hand a live link failure to failover. Lost acks are not failures:
    /// dead sockets are caught by the ping timeout.
    fn report(&self, topic: &Topic, kind: TransportKind, error: &TransportError) {
        if kind == TransportKind::Live && !matches!(error, TransportError::AckTimeout(_)) {
            let _ = self.failures.send(FailureReport {
                topic: topic.clone(),
                kind,
                reason: error.to_string(),
                at: Instant::now(),
            });
        }
    }

    async fn acquire(&self, topic: &Topic) -> Result<Arc<TopicChannel>> {
        let mut channels = self.channels.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        if let Some(channel) = channels.get(topic) {
            channel.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(channel.clone());
        }

        let channel = Arc::new(TopicChannel::new(topic.clone()));
        let kind = self.active_kind();
        let (link, opened_on) = match self.open_on(topic, kind).await {
            Ok(link) => (link, kind),
            Err(e) if kind == TransportKind::Live => {
                log::warn!("opening {} on live failed, using fallback: {}", topic, e);
                self.report(topic, kind, &e);
                let link = self.open_on(topic, TransportKind::Fallback).await.map_err(|e| {
                    log::error!("fallback open of {} failed: {}", topic, e);
                    SyncError::Unavailable(topic.to_string())
                })?;
                (link, TransportKind::Fallback)
            }
            Err(e) => {
                log::error!("fallback open of {} failed: {}", topic, e);
                return Err(SyncError::Unavailable(topic.to_string()));
            }
        };
        self.install(&channel, link, opened_on, false);
        channel.refs.store(1, Ordering::Release);
        channels.insert(topic.clone(), channel.clone());
        log::debug!("opened {} on {}", topic, opened_on);
        Ok(channel)
    }

    async fn open_on(&self, topic: &Topic, kind: TransportKind) -> std::result::Result<Link, TransportError> {
        self.transport(kind)?.open(topic).await
    }

    /// Swap `channel` onto `link` (opened on `kind`), optionally announcing
    /// the move.
    ///
    /// The announcement is dispatched before the new link's pump starts and
    /// after the old pump can no longer deliver, so subscribers see old
    /// frames, then the marker, then new frames.
    fn install(&self, channel: &Arc<TopicChannel>, mut link: Link, kind: TransportKind, announce: bool) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let _order = channel.dispatch.lock();
            channel.generation.store(generation, Ordering::Release);
            if announce {
                channel.slots.emit(&ChannelSignal::Rehomed(kind), &self.metrics);
            }
        }

        let inbound = link.take_inbound();
        let pump_channel = channel.clone();
        let metrics = self.metrics.clone();
        let failures = self.failures.clone();
        let pump = self.runtime.spawn(async move {
            if let Some(mut inbound) = inbound {
                while let Some(envelope) = inbound.next().await {
                    if !pump_channel.deliver(generation, envelope, &metrics) {
                        return;
                    }
                }
            }
            if kind == TransportKind::Live && pump_channel.generation.load(Ordering::Acquire) == generation {
                log::warn!("live link for {} ended unexpectedly", pump_channel.topic);
                let _ = failures.send(FailureReport {
                    topic: pump_channel.topic.clone(),
                    kind,
                    reason: "inbound stream ended".into(),
                    at: Instant::now(),
                });
            }
        });

        let previous = channel.link.write().replace(ActiveLink {
            kind,
            sender: link.sender(),
            pump,
        });
        if let Some(previous) = previous {
            previous.shut();
        }
        channel.relinked.notify_waiters();
    }

    fn release(&self, channel: Arc<TopicChannel>) {
        if channel.refs.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let Some(registry) = self.this.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            let mut channels = registry.channels.lock().await;
            // A concurrent acquire may have revived the channel
            if channel.refs.load(Ordering::Acquire) != 0 {
                return;
            }
            if channels.get(&channel.topic).is_some_and(|c| Arc::ptr_eq(c, &channel)) {
                channels.remove(&channel.topic);
            }
            drop(channels);
            registry.retire(&channel);
            log::debug!("closed {}", channel.topic);
        });
    }

    fn retire(&self, channel: &TopicChannel) {
        let _order = channel.dispatch.lock();
        channel
            .generation
            .store(self.next_generation.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        if let Some(link) = channel.link.write().take() {
            link.shut();
        }
    }

    /// Move every open topic onto `kind` and make it the active transport.
    ///
    /// Topics already on `kind` are left alone. When re-homing onto live
    /// fails the error is returned and the remaining topics stay where they
    /// are; callers fall back by switching to [`TransportKind::Fallback`].
    pub async fn switch_to(&self, kind: TransportKind) -> std::result::Result<usize, TransportError> {
        let channels = self.channels.lock().await;
        *self.active.write() = kind;
        let mut moved = 0;
        for channel in channels.values() {
            if channel.transport_kind() == Some(kind) {
                continue;
            }
            match self.open_on(&channel.topic, kind).await {
                Ok(link) => {
                    self.install(channel, link, kind, true);
                    self.metrics.record_rehome();
                    moved += 1;
                }
                Err(e) => {
                    log::warn!("re-homing {} onto {} failed: {}", channel.topic, kind, e);
                    if kind == TransportKind::Live {
                        *self.active.write() = TransportKind::Fallback;
                        return Err(e);
                    }
                }
            }
        }
        if moved > 0 {
            log::info!("re-homed {} topic(s) onto {}", moved, kind);
        }
        Ok(moved)
    }

    pub async fn topic_stats(&self) -> Vec<TopicStats> {
        let channels = self.channels.lock().await;
        let mut stats: Vec<TopicStats> = channels
            .values()
            .map(|c| TopicStats {
                topic: c.topic.to_string(),
                subscribers: c.slots.len(),
                references: c.refs.load(Ordering::Relaxed),
                transport: c.transport_kind(),
                delivered: c.delivered.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }

    pub async fn open_topics(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Close every link. Later subscribes and publishes fail with `ShutDown`.
    pub async fn shutdown(&self) {
        let mut channels = self.channels.lock().await;
        self.closed.store(true, Ordering::Release);
        for (_, channel) in channels.drain() {
            self.retire(&channel);
        }
    }
}
