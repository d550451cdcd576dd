//! Pluggable pub/sub carriers.
//!
//! A [`Transport`] opens one [`Link`] per topic. Links deliver every envelope
//! published on their topic (including the link's own publishes) with a
//! sequence number assigned by the publishing side of the carrier. The live
//! implementation talks to a broker over WebSockets; the fallback is an
//! in-process bus.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;

use crate::errors::TransportError;
use crate::realtime::envelope::Envelope;
use crate::realtime::topic::Topic;

pub mod local;
#[cfg(test)]
pub(crate) mod scripted;
pub mod ws;

pub use local::{LocalBus, LocalTopicStats};
pub use ws::WsTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Live,
    Fallback,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Live => "live",
            Self::Fallback => "fallback",
        })
    }
}

/// Outbound half of a link.
#[async_trait]
pub trait LinkSender: Send + Sync {
    /// Publish and return the sequence number the carrier assigned.
    async fn send(&self, envelope: Envelope) -> Result<u64, TransportError>;

    /// Stop the link. Inbound delivery ends; later sends fail.
    fn close(&self);
}

/// One topic's connection on a transport.
pub struct Link {
    topic: Topic,
    kind: TransportKind,
    sender: Arc<dyn LinkSender>,
    inbound: Option<BoxStream<'static, Envelope>>,
}

impl Link {
    pub fn new(
        topic: Topic,
        kind: TransportKind,
        sender: Arc<dyn LinkSender>,
        inbound: BoxStream<'static, Envelope>,
    ) -> Self {
        Self {
            topic,
            kind,
            sender,
            inbound: Some(inbound),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn sender(&self) -> Arc<dyn LinkSender> {
        self.sender.clone()
    }

    /// Inbound frames; can be taken once. The stream ends when the link dies.
    pub fn take_inbound(&mut self) -> Option<BoxStream<'static, Envelope>> {
        self.inbound.take()
    }

    pub async fn send(&self, envelope: Envelope) -> Result<u64, TransportError> {
        self.sender.send(envelope).await
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("topic", &self.topic.to_string())
            .field("kind", &self.kind)
            .finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn open(&self, topic: &Topic) -> Result<Link, TransportError>;

    /// Cheap reachability check used before (re)connecting.
    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
