//! Controllable transport for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Link, LinkSender, Transport, TransportKind};
use crate::errors::TransportError;
use crate::realtime::envelope::Envelope;
use crate::realtime::topic::Topic;

type Feeds = Arc<Mutex<HashMap<Topic, mpsc::UnboundedSender<Envelope>>>>;

pub(crate) struct ScriptedTransport {
    kind: TransportKind,
    feeds: Feeds,
    reachable: Arc<AtomicBool>,
    next_seq: Arc<AtomicU64>,
    faults: Arc<Faults>,
    pub(crate) opened: AtomicUsize,
    pub(crate) probes: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(kind: TransportKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            feeds: Arc::new(Mutex::new(HashMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
            next_seq: Arc::new(AtomicU64::new(0)),
            faults: Arc::new(Faults::default()),
            opened: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        })
    }

    /// Inject a frame as if it arrived from the carrier.
    pub(crate) fn push(&self, envelope: Envelope) -> bool {
        let feeds = self.feeds.lock();
        feeds
            .get(&envelope.topic)
            .is_some_and(|feed| feed.send(envelope).is_ok())
    }

    /// Make the carrier unreachable and end every open link.
    pub(crate) fn cut(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        self.feeds.lock().clear();
    }

    pub(crate) fn restore(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    /// Sends never complete until cleared.
    pub(crate) fn stall_sends(&self, on: bool) {
        self.faults.stall.store(on, Ordering::SeqCst);
    }

    /// Sends deliver the frame but report a lost ack.
    pub(crate) fn lose_acks(&self, on: bool) {
        self.faults.lose_acks.store(on, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Faults {
    stall: AtomicBool,
    lose_acks: AtomicBool,
}

struct ScriptedSender {
    topic: Topic,
    feeds: Feeds,
    reachable: Arc<AtomicBool>,
    next_seq: Arc<AtomicU64>,
    faults: Arc<Faults>,
}

#[async_trait]
impl LinkSender for ScriptedSender {
    async fn send(&self, mut envelope: Envelope) -> Result<u64, TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.topic.to_string()));
        }
        if self.faults.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        envelope.seq = seq;
        if let Some(feed) = self.feeds.lock().get(&self.topic) {
            let _ = feed.send(envelope);
        }
        if self.faults.lose_acks.load(Ordering::SeqCst) {
            return Err(TransportError::AckTimeout(self.topic.to_string()));
        }
        Ok(seq)
    }

    fn close(&self) {}
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self, topic: &Topic) -> Result<Link, TransportError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                url: topic.to_string(),
                reason: "unreachable".into(),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().insert(topic.clone(), tx);
        let sender = Arc::new(ScriptedSender {
            topic: topic.clone(),
            feeds: self.feeds.clone(),
            reachable: self.reachable.clone(),
            next_seq: self.next_seq.clone(),
            faults: self.faults.clone(),
        });
        Ok(Link::new(
            topic.clone(),
            self.kind,
            sender,
            UnboundedReceiverStream::new(rx).boxed(),
        ))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Probe("unreachable".into()))
        }
    }
}
