use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Link, LinkSender, Transport, TransportKind};
use crate::config::TransportConfig;
use crate::errors::TransportError;
use crate::realtime::envelope::Envelope;
use crate::realtime::topic::Topic;

/// Characters escaped in the topic path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live carrier: one WebSocket per topic against an `arcade-broker`.
///
/// Topics map to `{backend}/topics/{topic}`. The broker stamps sequence
/// numbers and echoes each publish back to its sender with the publish
/// `ref` intact, which is how `send` learns the assigned number.
pub struct WsTransport {
    base_url: String,
    health_url: String,
    config: TransportConfig,
    http: reqwest::Client,
}

impl WsTransport {
    pub fn new(base_url: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let http_base = if let Some(rest) = base_url.strip_prefix("wss://") {
            format!("https://{rest}")
        } else if let Some(rest) = base_url.strip_prefix("ws://") {
            format!("http://{rest}")
        } else {
            return Err(TransportError::Connect {
                url: base_url,
                reason: "expected a ws:// or wss:// url".into(),
            });
        };
        let http = reqwest::Client::builder()
            .timeout(config.connect_timeout())
            .build()
            .map_err(|e| TransportError::Probe(e.to_string()))?;
        Ok(Self {
            health_url: format!("{http_base}/health"),
            base_url,
            config,
            http,
        })
    }

    pub fn topic_url(&self, topic: &Topic) -> String {
        format!(
            "{}/topics/{}",
            self.base_url,
            utf8_percent_encode(&topic.to_string(), SEGMENT)
        )
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Live
    }

    async fn open(&self, topic: &Topic) -> Result<Link, TransportError> {
        let url = self.topic_url(topic);
        let (socket, _response) = match timeout(self.config.connect_timeout(), connect_async(url.as_str())).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    url,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(TransportError::ConnectTimeout(url)),
        };
        log::debug!("live link open: {}", url);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(drive(socket, topic.to_string(), command_rx, inbound_tx, self.config.clone()));

        let sender = Arc::new(WsLinkSender {
            topic: topic.to_string(),
            commands,
            next_ref: AtomicU64::new(0),
            ack_timeout: self.config.ack_timeout(),
        });
        Ok(Link::new(
            topic.clone(),
            TransportKind::Live,
            sender,
            UnboundedReceiverStream::new(inbound_rx).boxed(),
        ))
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let response = self
            .http
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| TransportError::Probe(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Probe(format!("health returned {}", response.status())))
        }
    }
}

enum Command {
    Publish {
        envelope: Envelope,
        ack: Ack,
    },
    /// The publisher stopped waiting for this reference
    Forget(u64),
    Close,
}

type Ack = oneshot::Sender<Result<u64, TransportError>>;

/// Publishes written to the socket whose echo has not come back yet.
#[derive(Default)]
struct PendingAcks {
    waiting: HashMap<u64, Ack>,
}

impl PendingAcks {
    fn insert(&mut self, reference: u64, ack: Ack) {
        // Publishers that gave up without a Forget (dropped futures)
        self.waiting.retain(|_, ack| !ack.is_closed());
        self.waiting.insert(reference, ack);
    }

    fn resolve(&mut self, reference: u64, seq: u64) {
        if let Some(ack) = self.waiting.remove(&reference) {
            let _ = ack.send(Ok(seq));
        }
    }

    fn forget(&mut self, reference: u64) {
        self.waiting.remove(&reference);
    }

    fn fail_all(&mut self, topic: &str) {
        for (_, ack) in self.waiting.drain() {
            let _ = ack.send(Err(TransportError::Closed(topic.to_string())));
        }
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

struct WsLinkSender {
    topic: String,
    commands: mpsc::UnboundedSender<Command>,
    next_ref: AtomicU64,
    ack_timeout: std::time::Duration,
}

#[async_trait]
impl LinkSender for WsLinkSender {
    async fn send(&self, mut envelope: Envelope) -> Result<u64, TransportError> {
        envelope.seq = 0;
        let reference = self.next_ref.fetch_add(1, Ordering::Relaxed) + 1;
        envelope.reference = Some(reference);
        let (ack, acked) = oneshot::channel();
        self.commands
            .send(Command::Publish { envelope, ack })
            .map_err(|_| TransportError::Closed(self.topic.clone()))?;
        match timeout(self.ack_timeout, acked).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed(self.topic.clone())),
            Err(_) => {
                let _ = self.commands.send(Command::Forget(reference));
                Err(TransportError::AckTimeout(self.topic.clone()))
            }
        }
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// Owns the socket: writes publishes, reads frames, pings.
///
/// Returning drops `inbound`, which ends the link's inbound stream.
async fn drive(
    mut socket: Socket,
    topic: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedSender<Envelope>,
    config: TransportConfig,
) {
    let mut pending = PendingAcks::default();
    let mut ping = interval_at(Instant::now() + config.ping_interval(), config.ping_interval());
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Publish { envelope, ack }) => {
                    let reference = envelope.reference.unwrap_or_default();
                    let text = match envelope.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            let _ = ack.send(Err(e.into()));
                            continue;
                        }
                    };
                    if let Err(e) = socket.send(Message::Text(text.into())).await {
                        log::warn!("live link {} write failed: {}", topic, e);
                        let _ = ack.send(Err(TransportError::Closed(topic.clone())));
                        break;
                    }
                    pending.insert(reference, ack);
                }
                Some(Command::Forget(reference)) => {
                    pending.forget(reference);
                    log::debug!("live link {} gave up on ack #{}, {} still pending", topic, reference, pending.len());
                }
                Some(Command::Close) | None => {
                    let _ = socket.close(None).await;
                    break;
                }
            },
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    last_seen = Instant::now();
                    match Envelope::from_json(text.as_str()) {
                        Ok(mut envelope) => {
                            if let Some(reference) = envelope.reference.take() {
                                pending.resolve(reference, envelope.seq);
                            }
                            if inbound.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("live link {} dropped malformed frame: {}", topic, e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("live link {} closed by broker", topic);
                    break;
                }
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(e)) => {
                    log::warn!("live link {} read failed: {}", topic, e);
                    break;
                }
            },
            _ = ping.tick() => {
                if last_seen.elapsed() > config.ping_timeout() {
                    log::warn!("live link {} silent for {:?}, declaring it dead", topic, last_seen.elapsed());
                    break;
                }
                if socket.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    pending.fail_all(&topic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_urls() {
        let t = WsTransport::new("ws://127.0.0.1:9400/", TransportConfig::default()).unwrap();
        assert_eq!(t.health_url, "http://127.0.0.1:9400/health");
        let topic = Topic::leaderboard("snake", crate::Period::Weekly).unwrap();
        assert_eq!(t.topic_url(&topic), "ws://127.0.0.1:9400/topics/leaderboard:snake:weekly");

        let t = WsTransport::new("wss://sync.example.com", TransportConfig::default()).unwrap();
        assert_eq!(t.health_url, "https://sync.example.com/health");
    }

    #[test]
    fn rejects_non_ws_urls() {
        assert!(WsTransport::new("http://localhost", TransportConfig::default()).is_err());
    }

    /// Broker stand-in that swallows the first publish and echoes the rest.
    async fn forgetful_broker() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let mut seq = 0;
            let mut swallowed = false;
            while let Some(Ok(frame)) = socket.next().await {
                let Message::Text(text) = frame else {
                    continue;
                };
                if !swallowed {
                    swallowed = true;
                    continue;
                }
                let mut envelope = Envelope::from_json(text.as_str()).unwrap();
                seq += 1;
                envelope.seq = seq;
                socket
                    .send(Message::Text(envelope.to_json().unwrap().into()))
                    .await
                    .unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn lost_ack_times_out_without_killing_the_link() {
        let addr = forgetful_broker().await;
        let config = TransportConfig {
            ack_timeout_ms: 200,
            ..TransportConfig::default()
        };
        let transport = WsTransport::new(&format!("ws://{addr}"), config).unwrap();
        let topic = Topic::events("snake").unwrap();
        let mut link = transport.open(&topic).await.unwrap();
        let mut inbound = link.take_inbound().unwrap();
        let frame = || Envelope::new(topic.clone(), "game_started", serde_json::json!({}));

        assert!(matches!(link.send(frame()).await, Err(TransportError::AckTimeout(_))));
        assert_eq!(link.send(frame()).await.unwrap(), 1);
        assert_eq!(inbound.next().await.unwrap().seq, 1);
    }

    #[test]
    fn pending_acks_drop_abandoned_publishers() {
        let mut pending = PendingAcks::default();
        let (kept, mut kept_rx) = oneshot::channel();
        let (abandoned, abandoned_rx) = oneshot::channel();
        let (forgotten, _forgotten_rx) = oneshot::channel();
        pending.insert(1, kept);
        pending.insert(2, abandoned);
        drop(abandoned_rx);
        pending.insert(3, forgotten);
        pending.forget(3);
        assert_eq!(pending.len(), 1);

        pending.resolve(9, 4);
        pending.resolve(1, 7);
        assert!(matches!(kept_rx.try_recv(), Ok(Ok(7))));
        assert_eq!(pending.len(), 0);
    }
}
