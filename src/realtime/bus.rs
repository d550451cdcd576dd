use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::errors::{Result, TransportError};
use crate::metrics::SyncMetrics;
use crate::realtime::envelope::Envelope;
use crate::realtime::registry::{ChannelRegistry, ChannelSignal};
use crate::realtime::sequence::{GapCause, SeqCheck, SequenceGap, SequenceTracker};
use crate::realtime::subscription::Subscription;
use crate::realtime::topic::{Topic, TopicKind};
use crate::realtime::types::DomainEvent;

#[derive(Clone, Debug, PartialEq)]
pub struct SequencedEvent {
    pub topic: Topic,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub event: DomainEvent,
}

/// What an event-bus subscriber receives.
#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    Event(SequencedEvent),
    /// Messages may have been missed; reconcile from the store.
    Gap(SequenceGap),
}

/// Typed domain events over `events:{gameId}` topics.
///
/// Each subscription tracks sequence numbers on its own: duplicates are
/// dropped, skips surface as [`BusMessage::Gap`] ahead of the event that
/// revealed them, and a transport switch surfaces as a gap too.
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<ChannelRegistry>,
    metrics: Arc<SyncMetrics>,
}

impl EventBus {
    pub fn new(registry: Arc<ChannelRegistry>, metrics: Arc<SyncMetrics>) -> Self {
        Self { registry, metrics }
    }

    pub async fn publish(&self, game_id: &str, event: DomainEvent) -> Result<u64> {
        self.publish_to(&Topic::events(game_id)?, event).await
    }

    pub async fn publish_to(&self, topic: &Topic, event: DomainEvent) -> Result<u64> {
        topic.expect_kind(TopicKind::Events)?;
        let envelope = Envelope::event(topic.clone(), &event).map_err(TransportError::from)?;
        let seq = self.registry.publish(envelope).await?;
        log::debug!("published {} on {} as #{}", event.kind(), topic, seq);
        Ok(seq)
    }

    pub async fn subscribe(
        &self,
        game_id: &str,
        callback: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        self.subscribe_to(&Topic::events(game_id)?, callback).await
    }

    pub async fn subscribe_to(
        &self,
        topic: &Topic,
        callback: impl Fn(&BusMessage) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        topic.expect_kind(TopicKind::Events)?;
        let tracker = Mutex::new(SequenceTracker::new());
        let metrics = self.metrics.clone();
        let topic_name = topic.clone();
        self.registry
            .subscribe(topic, move |signal| match signal {
                ChannelSignal::Frame(envelope) => {
                    let check = tracker.lock().observe(envelope.seq);
                    match check {
                        SeqCheck::Duplicate => {
                            metrics.record_duplicate();
                            log::debug!("dropping duplicate #{} on {}", envelope.seq, topic_name);
                            return;
                        }
                        SeqCheck::Gap { expected, received } => {
                            metrics.record_gap();
                            log::info!("gap on {}: expected #{}, got #{}", topic_name, expected, received);
                            callback(&BusMessage::Gap(SequenceGap {
                                topic: topic_name.clone(),
                                cause: GapCause::Missed { expected, received },
                            }));
                        }
                        SeqCheck::First | SeqCheck::InOrder => {}
                    }
                    match envelope.decode_event() {
                        Ok(event) => {
                            metrics.record_delivered();
                            callback(&BusMessage::Event(SequencedEvent {
                                topic: topic_name.clone(),
                                seq: envelope.seq,
                                ts: envelope.ts,
                                event,
                            }));
                        }
                        Err(e) => {
                            metrics.record_malformed();
                            log::warn!("dropping #{} on {}: {}", envelope.seq, topic_name, e);
                        }
                    }
                }
                ChannelSignal::Rehomed(kind) => {
                    tracker.lock().reset();
                    metrics.record_gap();
                    callback(&BusMessage::Gap(SequenceGap {
                        topic: topic_name.clone(),
                        cause: GapCause::TransportSwitched { to: *kind },
                    }));
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SyncError;
    use crate::realtime::transport::scripted::ScriptedTransport;
    use crate::realtime::transport::{LocalBus, Transport, TransportKind};
    use crate::realtime::types::{PlayerLeft, SessionId};
    use serde_json::json;
    use std::time::Duration;

    fn bus(local: &Arc<LocalBus>) -> (EventBus, Arc<SyncMetrics>) {
        let metrics = Arc::new(SyncMetrics::new());
        let (registry, _) = ChannelRegistry::new(None, local.clone(), metrics.clone(), Duration::from_millis(20));
        (EventBus::new(registry, metrics.clone()), metrics)
    }

    fn collect() -> (Arc<Mutex<Vec<BusMessage>>>, impl Fn(&BusMessage) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |m: &BusMessage| sink.lock().push(m.clone()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn delivers_typed_events_in_order() {
        let local = LocalBus::new(32);
        let (bus, _) = bus(&local);
        let (seen, cb) = collect();
        let _sub = bus.subscribe("snake", cb).await.unwrap();

        assert_eq!(bus.publish("snake", DomainEvent::GameStarted).await.unwrap(), 1);
        let left = DomainEvent::PlayerLeft(PlayerLeft {
            session_id: SessionId::from("s1"),
        });
        assert_eq!(bus.publish("snake", left.clone()).await.unwrap(), 2);
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(&seen[0], BusMessage::Event(e) if e.event == DomainEvent::GameStarted && e.seq == 1));
        assert!(matches!(&seen[1], BusMessage::Event(e) if e.event == left));
    }

    #[tokio::test]
    async fn unknown_types_are_dropped_without_breaking_order() {
        let local = LocalBus::new(32);
        let (bus, metrics) = bus(&local);
        let (seen, cb) = collect();
        let _sub = bus.subscribe("snake", cb).await.unwrap();
        let topic = Topic::events("snake").unwrap();

        bus.publish("snake", DomainEvent::GameStarted).await.unwrap();
        settle().await;
        local.publish(Envelope::new(topic.clone(), "mystery", json!({})));
        local.publish(Envelope::new(topic.clone(), "mystery", json!({})));
        settle().await;
        bus.publish("snake", DomainEvent::GameEnded).await.unwrap();
        settle().await;

        let seen = seen.lock();
        let kinds: Vec<&str> = seen
            .iter()
            .map(|m| match m {
                BusMessage::Event(_) => "event",
                BusMessage::Gap(_) => "gap",
            })
            .collect();
        assert_eq!(kinds, vec!["event", "event"]);
        assert_eq!(metrics.snapshot().dropped_malformed, 2);
    }

    #[tokio::test]
    async fn lagging_link_reports_missed_range() {
        let local = LocalBus::new(2);
        let (bus, metrics) = bus(&local);
        let (seen, cb) = collect();
        let _sub = bus.subscribe("snake", cb).await.unwrap();
        let topic = Topic::events("snake").unwrap();

        bus.publish("snake", DomainEvent::GameStarted).await.unwrap();
        settle().await;
        // Overflow the link buffer without yielding to the pump
        for _ in 0..6 {
            local.publish(Envelope::event(topic.clone(), &DomainEvent::GameEnded).unwrap());
        }
        settle().await;

        let seen = seen.lock();
        assert!(seen.iter().any(|m| matches!(
            m,
            BusMessage::Gap(SequenceGap { cause: GapCause::Missed { expected: 2, received: 6 }, .. })
        )));
        assert_eq!(metrics.snapshot().gaps, 1);
    }

    #[tokio::test]
    async fn rejects_non_event_topics() {
        let local = LocalBus::new(4);
        let (bus, _) = bus(&local);
        let presence = Topic::presence("snake").unwrap();
        assert!(matches!(
            bus.publish_to(&presence, DomainEvent::GameStarted).await,
            Err(SyncError::TopicKind { .. })
        ));
        assert!(bus.subscribe_to(&presence, |_| {}).await.is_err());
    }

    #[tokio::test]
    async fn duplicates_and_replays_are_dropped() {
        let scripted = ScriptedTransport::new(TransportKind::Fallback);
        let metrics = Arc::new(SyncMetrics::new());
        let (registry, _) = ChannelRegistry::new(None, scripted.clone(), metrics.clone(), Duration::from_millis(20));
        let bus = EventBus::new(registry, metrics.clone());
        let (seen, cb) = collect();
        let topic = Topic::events("snake").unwrap();
        let _sub = bus.subscribe("snake", cb).await.unwrap();

        for seq in [1, 2, 2, 1, 3] {
            let mut env = Envelope::event(topic.clone(), &DomainEvent::GameStarted).unwrap();
            env.seq = seq;
            assert!(scripted.push(env));
        }
        settle().await;

        let seqs: Vec<u64> = seen
            .lock()
            .iter()
            .filter_map(|m| match m {
                BusMessage::Event(e) => Some(e.seq),
                BusMessage::Gap(_) => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(metrics.snapshot().duplicates, 2);
    }

    #[tokio::test]
    async fn transport_switch_resets_tracking() {
        let live = ScriptedTransport::new(TransportKind::Live);
        let local = LocalBus::new(8);
        let metrics = Arc::new(SyncMetrics::new());
        let (registry, _) = ChannelRegistry::new(
            Some(live.clone() as Arc<dyn Transport>),
            local.clone(),
            metrics.clone(),
            Duration::from_millis(20),
        );
        let bus = EventBus::new(registry.clone(), metrics.clone());
        let (seen, cb) = collect();
        let _sub = bus.subscribe("snake", cb).await.unwrap();

        for _ in 0..3 {
            bus.publish("snake", DomainEvent::GameStarted).await.unwrap();
        }
        settle().await;
        registry.switch_to(TransportKind::Live).await.unwrap();
        assert_eq!(bus.publish("snake", DomainEvent::GameEnded).await.unwrap(), 1);
        settle().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(matches!(
            &seen[3],
            BusMessage::Gap(SequenceGap { cause: GapCause::TransportSwitched { to: TransportKind::Live }, .. })
        ));
        assert!(matches!(&seen[4], BusMessage::Event(e) if e.seq == 1 && e.event == DomainEvent::GameEnded));
    }
}
