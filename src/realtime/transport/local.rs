use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{Link, LinkSender, Transport, TransportKind};
use crate::errors::TransportError;
use crate::realtime::envelope::Envelope;
use crate::realtime::topic::Topic;

/// Statistics for one topic on the in-process bus
#[derive(Clone, Debug, Serialize)]
pub struct LocalTopicStats {
    pub topic: String,
    pub links: usize,
    pub total_messages: u64,
    /// Frames a slow link missed because its buffer overflowed
    pub dropped_messages: u64,
}

struct LocalTopic {
    sender: broadcast::Sender<Envelope>,
    /// Guards stamping and sending so buffer order equals sequence order
    next_seq: Mutex<u64>,
    total_messages: AtomicU64,
    dropped_messages: Arc<AtomicU64>,
}

impl LocalTopic {
    fn publish(&self, mut envelope: Envelope) -> u64 {
        let mut next = self.next_seq.lock();
        *next += 1;
        envelope.seq = *next;
        envelope.reference = None;
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        // Err only means nobody is listening right now
        let _ = self.sender.send(envelope);
        *next
    }
}

/// In-process pub/sub used when the live backend is unreachable.
///
/// Same contract as the live broker: per-topic monotonic sequence numbers
/// and every link on the topic (the publisher included) sees each frame.
/// One bus is shared by everything in a process that should see each
/// other's traffic.
///
/// A topic exists while at least one link is open on it; once the last
/// link goes it is forgotten and numbering starts over.
pub struct LocalBus {
    topics: Arc<Topics>,
    buffer_size: usize,
}

type Topics = DashMap<Topic, Arc<LocalTopic>>;

fn forget_if_idle(topics: &Topics, topic: &Topic) {
    topics.remove_if(topic, |_, local| local.sender.receiver_count() == 0);
}

impl LocalBus {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: Arc::new(DashMap::new()),
            buffer_size: buffer_size.max(1),
        })
    }

    /// Holds the map entry; subscribe through it so a concurrent
    /// [`forget_if_idle`] cannot orphan the new receiver.
    fn topic(&self, topic: &Topic) -> RefMut<'_, Topic, Arc<LocalTopic>> {
        self.topics.entry(topic.clone()).or_insert_with(|| {
            let (sender, _) = broadcast::channel(self.buffer_size);
            Arc::new(LocalTopic {
                sender,
                next_seq: Mutex::new(0),
                total_messages: AtomicU64::new(0),
                dropped_messages: Arc::new(AtomicU64::new(0)),
            })
        })
    }

    /// Publish without a link; returns the assigned sequence number.
    pub fn publish(&self, envelope: Envelope) -> u64 {
        let topic = envelope.topic.clone();
        let local = self.topic(&topic).clone();
        let seq = local.publish(envelope);
        forget_if_idle(&self.topics, &topic);
        seq
    }

    pub fn stats(&self) -> Vec<LocalTopicStats> {
        let mut stats: Vec<LocalTopicStats> = self
            .topics
            .iter()
            .map(|entry| LocalTopicStats {
                topic: entry.key().to_string(),
                links: entry.sender.receiver_count(),
                total_messages: entry.total_messages.load(Ordering::Relaxed),
                dropped_messages: entry.dropped_messages.load(Ordering::Relaxed),
            })
            .collect();
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

/// Inbound half of a local link. The topic is forgotten with its last one.
struct LocalInbound {
    frames: Option<BoxStream<'static, Envelope>>,
    topics: Arc<Topics>,
    topic: Topic,
}

impl Stream for LocalInbound {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        match self.frames.as_mut() {
            Some(frames) => frames.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }
}

impl Drop for LocalInbound {
    fn drop(&mut self) {
        // Release the receiver before counting
        self.frames.take();
        forget_if_idle(&self.topics, &self.topic);
    }
}

struct LocalLinkSender {
    topic: Arc<LocalTopic>,
    name: String,
    closed: AtomicBool,
}

#[async_trait]
impl LinkSender for LocalLinkSender {
    async fn send(&self, envelope: Envelope) -> Result<u64, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed(self.name.clone()));
        }
        Ok(self.topic.publish(envelope))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl Transport for LocalBus {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn open(&self, topic: &Topic) -> Result<Link, TransportError> {
        let (local, receiver) = {
            let entry = self.topic(topic);
            (entry.clone(), entry.sender.subscribe())
        };
        let dropped = local.dropped_messages.clone();
        let name = topic.to_string();
        let lag_name = name.clone();
        let frames = BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let frame = match item {
                    Ok(envelope) => Some(envelope),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("local link on {} lagged, {} frames dropped", lag_name, n);
                        None
                    }
                };
                std::future::ready(frame)
            })
            .boxed();
        let inbound = LocalInbound {
            frames: Some(frames),
            topics: self.topics.clone(),
            topic: topic.clone(),
        };

        let sender = Arc::new(LocalLinkSender {
            topic: local,
            name,
            closed: AtomicBool::new(false),
        });
        Ok(Link::new(topic.clone(), TransportKind::Fallback, sender, inbound.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::types::DomainEvent;
    use serde_json::json;

    fn envelope(topic: &Topic) -> Envelope {
        Envelope::new(topic.clone(), DomainEvent::GAME_STARTED, json!({}))
    }

    #[tokio::test]
    async fn publisher_and_peers_see_numbered_frames() {
        let bus = LocalBus::new(16);
        let topic = Topic::events("snake").unwrap();
        let mut a = bus.open(&topic).await.unwrap();
        let mut b = bus.open(&topic).await.unwrap();
        let mut a_in = a.take_inbound().unwrap();
        let mut b_in = b.take_inbound().unwrap();

        assert_eq!(a.send(envelope(&topic)).await.unwrap(), 1);
        assert_eq!(b.send(envelope(&topic)).await.unwrap(), 2);

        for inbound in [&mut a_in, &mut b_in] {
            assert_eq!(inbound.next().await.unwrap().seq, 1);
            assert_eq!(inbound.next().await.unwrap().seq, 2);
        }
        assert!(a.take_inbound().is_none());
    }

    #[tokio::test]
    async fn topics_number_independently() {
        let bus = LocalBus::new(16);
        let snake = Topic::events("snake").unwrap();
        let tetris = Topic::events("tetris").unwrap();
        let _snake_link = bus.open(&snake).await.unwrap();
        let _tetris_link = bus.open(&tetris).await.unwrap();
        assert_eq!(bus.publish(envelope(&snake)), 1);
        assert_eq!(bus.publish(envelope(&snake)), 2);
        assert_eq!(bus.publish(envelope(&tetris)), 1);
        assert_eq!(bus.topic_count(), 2);
    }

    #[tokio::test]
    async fn closed_link_rejects_sends() {
        let bus = LocalBus::new(16);
        let topic = Topic::presence("snake").unwrap();
        let link = bus.open(&topic).await.unwrap();
        link.close();
        assert!(matches!(
            link.send(envelope(&topic)).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn slow_links_count_dropped_frames() {
        let bus = LocalBus::new(2);
        let topic = Topic::events("snake").unwrap();
        let mut link = bus.open(&topic).await.unwrap();
        let mut inbound = link.take_inbound().unwrap();
        for _ in 0..5 {
            bus.publish(envelope(&topic));
        }
        assert_eq!(inbound.next().await.unwrap().seq, 4);
        assert_eq!(bus.stats()[0].dropped_messages, 3);
    }

    #[tokio::test]
    async fn topic_is_forgotten_with_its_last_link() {
        let bus = LocalBus::new(16);
        let topic = Topic::events("snake").unwrap();
        let first = bus.open(&topic).await.unwrap();
        let second = bus.open(&topic).await.unwrap();
        first.send(envelope(&topic)).await.unwrap();

        drop(first);
        assert_eq!(bus.topic_count(), 1);
        drop(second);
        assert_eq!(bus.topic_count(), 0);

        // Nobody listening: nothing kept
        assert_eq!(bus.publish(envelope(&topic)), 1);
        assert_eq!(bus.publish(envelope(&topic)), 1);
        assert_eq!(bus.topic_count(), 0);

        let reopened = bus.open(&topic).await.unwrap();
        assert_eq!(reopened.send(envelope(&topic)).await.unwrap(), 1);
    }
}
