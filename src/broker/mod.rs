//! Live backend for [`WsTransport`](crate::realtime::transport::WsTransport)
//!
//! One WebSocket per client topic link at `/topics/{topic}`. The broker
//! stamps every inbound publish with the topic's next sequence number and
//! the broker clock, then fans it out to every socket on the topic. The
//! publishing socket gets its frame back with the correlation `ref` intact,
//! which is its acknowledgement; everyone else sees the frame without it.
//!
//! The same router serves `/health`, `/stats` and a score REST API backed
//! by a [`MemoryScoreStore`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};

use crate::config::BrokerConfig;
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::realtime::envelope::Envelope;
use crate::realtime::topic::Topic;
use crate::store::MemoryScoreStore;

mod scores;

/// Frame fanned out on a topic, tagged with the connection that sent it
type Fanout = (u64, Envelope);

struct BrokerTopic {
    next_seq: Mutex<u64>,
    tx: broadcast::Sender<Fanout>,
}

impl BrokerTopic {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            next_seq: Mutex::new(0),
            tx,
        }
    }

    /// Stamp and fan out. Stamping and sending share the lock so frames
    /// leave in sequence order.
    fn publish(&self, origin: u64, mut envelope: Envelope) -> u64 {
        let mut next_seq = self.next_seq.lock();
        *next_seq += 1;
        envelope.seq = *next_seq;
        envelope.ts = Utc::now();
        // No receivers only happens if the origin just went away
        let _ = self.tx.send((origin, envelope));
        *next_seq
    }

    fn last_seq(&self) -> u64 {
        *self.next_seq.lock()
    }
}

/// Statistics for one broker topic
#[derive(Clone, Debug, Serialize)]
pub struct BrokerTopicStats {
    pub topic: String,
    pub connections: usize,
    pub last_seq: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub topics: Vec<BrokerTopicStats>,
    pub metrics: MetricsSnapshot,
}

pub struct Broker {
    topics: DashMap<Topic, Arc<BrokerTopic>>,
    channel_capacity: usize,
    scores: Arc<MemoryScoreStore>,
    metrics: SyncMetrics,
    next_connection: AtomicU64,
    connections: AtomicUsize,
    closing: watch::Sender<bool>,
}

impl Broker {
    pub fn new(config: &BrokerConfig) -> Arc<Self> {
        Self::with_store(config, Arc::new(MemoryScoreStore::new()))
    }

    pub fn with_store(config: &BrokerConfig, scores: Arc<MemoryScoreStore>) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            channel_capacity: config.channel_capacity,
            scores,
            metrics: SyncMetrics::new(),
            next_connection: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            closing: watch::channel(false).0,
        })
    }

    pub fn scores(&self) -> &Arc<MemoryScoreStore> {
        &self.scores
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/topics/{topic}", get(topic_socket))
            .route("/health", get(health))
            .route("/stats", get(stats))
            .route("/games/{game}/scores", get(scores::top_scores).post(scores::save_score))
            .route("/games/{game}/players/{session}/best", get(scores::personal_best))
            .with_state(self.clone())
    }

    /// Serve on `listener` until `shutdown` resolves, then close every
    /// topic socket.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("arcade broker listening on {}", addr);
        }
        let broker = self.clone();
        let shutdown = async move {
            shutdown.await;
            broker.close_connections();
        };
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }

    /// Close every open topic socket; clients see the link end.
    pub fn close_connections(&self) {
        self.closing.send_replace(true);
    }

    /// Attach a connection to `topic`, creating it on first use. The
    /// receiver is taken under the map entry so [`Broker::detach`] cannot
    /// drop the topic in between.
    fn attach(&self, topic: &Topic) -> (Arc<BrokerTopic>, broadcast::Receiver<Fanout>) {
        let entry = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| Arc::new(BrokerTopic::new(self.channel_capacity)));
        (entry.clone(), entry.tx.subscribe())
    }

    /// Forget `topic` once its last connection is gone.
    fn detach(&self, topic: &Topic, fanout: broadcast::Receiver<Fanout>) {
        drop(fanout);
        if self
            .topics
            .remove_if(topic, |_, channel| channel.tx.receiver_count() == 0)
            .is_some()
        {
            log::debug!("topic {} has no connections left, dropped", topic);
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let mut topics: Vec<BrokerTopicStats> = self
            .topics
            .iter()
            .map(|entry| BrokerTopicStats {
                topic: entry.key().to_string(),
                connections: entry.value().tx.receiver_count(),
                last_seq: entry.value().last_seq(),
            })
            .collect();
        topics.sort_by(|a, b| a.topic.cmp(&b.topic));
        BrokerStats {
            connections: self.connections.load(Ordering::Relaxed),
            topics,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Pump one client link until either side goes away.
    async fn serve_socket(self: Arc<Self>, topic: Topic, socket: WebSocket) {
        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            return;
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (channel, mut fanout) = self.attach(&topic);
        self.connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("connection {} joined {}", id, topic);

        let (mut write, mut read) = socket.split();
        loop {
            tokio::select! {
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => match Envelope::from_json(text.as_str()) {
                        Ok(envelope) if envelope.topic == topic => {
                            channel.publish(id, envelope);
                            self.metrics.record_published();
                        }
                        Ok(envelope) => {
                            self.metrics.record_malformed();
                            log::warn!("connection {} on {} sent a frame for {}", id, topic, envelope.topic);
                        }
                        Err(e) => {
                            self.metrics.record_malformed();
                            log::warn!("connection {} on {} sent a malformed frame: {}", id, topic, e);
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("connection {} on {} read failed: {}", id, topic, e);
                        break;
                    }
                },
                fanned = fanout.recv() => match fanned {
                    Ok((origin, mut envelope)) => {
                        if origin != id {
                            envelope.reference = None;
                        }
                        let text = match envelope.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                log::error!("encoding frame #{} on {} failed: {}", envelope.seq, topic, e);
                                continue;
                            }
                        };
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                        self.metrics.record_delivered();
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The client sees the skip as a sequence gap
                        log::warn!("connection {} on {} lagged, {} frame(s) skipped", id, topic, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = closing.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.detach(&topic, fanout);
        self.connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("connection {} left {}", id, topic);
    }
}

async fn topic_socket(
    State(broker): State<Arc<Broker>>,
    Path(raw): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    match raw.parse::<Topic>() {
        Ok(topic) => upgrade.on_upgrade(move |socket| broker.serve_socket(topic, socket)),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn stats(State(broker): State<Arc<Broker>>) -> Json<BrokerStats> {
    Json(broker.stats())
}
