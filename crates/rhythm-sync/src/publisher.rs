//! Sending facts over both paths and folding the two inbound copies back into one.

use lru::LruCache;
use rhythm_core::SessionFact;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::{Inbound, SyncChannel};
use crate::wire::{CodecError, Delivery, Fact, FactKind};

const SEEN_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(v) => v,
    None => unreachable!(),
};

/// Sends each fact on the paths its kind calls for
pub struct DualChannelPublisher {
    channel: Arc<dyn SyncChannel>,
}

impl DualChannelPublisher {
    #[must_use]
    pub fn new(channel: Arc<dyn SyncChannel>) -> Self {
        Self { channel }
    }

    /// Send `fact` transiently and, for session boundaries, publish it durably too.
    ///
    /// Both paths are always attempted. Transport failures are logged, never returned.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` only if the fact cannot be encoded.
    pub async fn publish_fact(&self, fact: &Fact) -> Result<(), CodecError> {
        let payload = fact.encode()?;
        let kind = fact.kind();
        let channel = self.channel.name();

        if !self.channel.reachable() {
            log::debug!(
                "{channel}: peer looks unreachable, sending `{}` anyway",
                kind.command()
            );
        }

        if let Err(e) = self.channel.send_transient(&payload).await {
            log::debug!("{channel}: transient `{}` not delivered: {e}", kind.command());
        }

        if kind.delivery() == Delivery::Dual {
            if let Err(e) = self.channel.publish_durable(kind.slot(), &payload).await {
                log::warn!("{channel}: durable `{}` not accepted: {e}", kind.command());
            }
        }
        Ok(())
    }

    /// Publish the wire form of an engine fact; local-only events are skipped.
    ///
    /// # Errors
    ///
    /// Returns `CodecError` if the fact cannot be encoded.
    pub async fn publish_session_fact(&self, fact: &SessionFact) -> Result<(), CodecError> {
        match Fact::from_session_fact(fact) {
            Some(wire) => self.publish_fact(&wire).await,
            None => Ok(()),
        }
    }

    /// Drain an engine outbox until every sender is gone
    pub async fn forward(&self, mut outbox: mpsc::UnboundedReceiver<SessionFact>) {
        while let Some(fact) = outbox.recv().await {
            if let Err(e) = self.publish_session_fact(&fact).await {
                log::error!("Failed to publish {:?}: {e}", fact.event);
            }
        }
        log::debug!("Outbox closed, publisher done");
    }
}

/// Decodes inbound payloads and drops the second copy of an identified session fact
pub struct InboundNormalizer {
    seen: LruCache<(FactKind, Uuid), ()>,
}

impl Default for InboundNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundNormalizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seen: LruCache::new(SEEN_CACHE_SIZE),
        }
    }

    /// `None` for malformed payloads and repeats.
    ///
    /// Facts without a session id pass through; the receiver applies them idempotently.
    pub fn accept(&mut self, inbound: &Inbound) -> Option<Fact> {
        let fact = match Fact::decode(&inbound.payload) {
            Ok(fact) => fact,
            Err(e) => {
                log::warn!("Dropping malformed {:?} payload: {e}", inbound.path);
                return None;
            }
        };

        if let Some(session_id) = fact.session_id() {
            if self.seen.put((fact.kind(), session_id), ()).is_some() {
                log::debug!(
                    "Dropping repeat `{}` for {session_id} via {:?}",
                    fact.kind().command(),
                    inbound.path
                );
                return None;
            }
        }
        Some(fact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, DeliveryPath};
    use crate::loopback::LoopbackChannel;
    use async_trait::async_trait;
    use rhythm_core::SessionEvent;
    use std::sync::Mutex;

    /// Transient path always fails; durable path always accepts
    #[derive(Default)]
    struct FlakyChannel {
        durable: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl SyncChannel for FlakyChannel {
        async fn send_transient(&self, _payload: &[u8]) -> Result<(), ChannelError> {
            Err(ChannelError::Unreachable)
        }

        async fn publish_durable(&self, slot: &str, payload: &[u8]) -> Result<(), ChannelError> {
            self.durable
                .lock()
                .unwrap()
                .push((slot.to_string(), payload.to_vec()));
            Ok(())
        }

        fn reachable(&self) -> bool {
            false
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Reports the peer as unreachable, yet both paths go through
    #[derive(Default)]
    struct PessimisticChannel {
        transient: Mutex<Vec<Vec<u8>>>,
        durable: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl SyncChannel for PessimisticChannel {
        async fn send_transient(&self, payload: &[u8]) -> Result<(), ChannelError> {
            self.transient.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn publish_durable(&self, slot: &str, payload: &[u8]) -> Result<(), ChannelError> {
            self.durable
                .lock()
                .unwrap()
                .push((slot.to_string(), payload.to_vec()));
            Ok(())
        }

        fn reachable(&self) -> bool {
            false
        }

        fn name(&self) -> &'static str {
            "pessimistic"
        }
    }

    fn finished(session_id: Option<Uuid>) -> Fact {
        Fact::TrainingFinished {
            session_id,
            total_reps: 20,
            warnings: 3,
        }
    }

    #[tokio::test]
    async fn test_durable_path_carries_facts_when_transient_fails() {
        let channel = Arc::new(FlakyChannel::default());
        let publisher = DualChannelPublisher::new(channel.clone());
        let id = Some(Uuid::new_v4());

        publisher
            .publish_fact(&Fact::TrainingStarted { session_id: id })
            .await
            .unwrap();
        publisher.publish_fact(&finished(id)).await.unwrap();

        let durable = channel.durable.lock().unwrap().clone();
        let mut normalizer = InboundNormalizer::new();
        let received: Vec<Fact> = durable
            .iter()
            .filter_map(|(_, payload)| {
                normalizer.accept(&Inbound {
                    path: DeliveryPath::Durable,
                    payload: payload.clone(),
                })
            })
            .collect();

        assert_eq!(
            received,
            vec![Fact::TrainingStarted { session_id: id }, finished(id)]
        );
        assert_eq!(durable[1].0, "training_finished");
    }

    #[tokio::test]
    async fn test_encouragement_is_transient_only() {
        let channel = Arc::new(FlakyChannel::default());
        let publisher = DualChannelPublisher::new(channel.clone());

        publisher.publish_fact(&Fact::PlayEncouragement).await.unwrap();
        assert!(channel.durable.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_both_paths_used_when_peer_looks_unreachable() {
        let channel = Arc::new(PessimisticChannel::default());
        let publisher = DualChannelPublisher::new(channel.clone());
        let id = Some(Uuid::new_v4());
        let started = Fact::TrainingStarted { session_id: id };

        publisher.publish_fact(&started).await.unwrap();
        publisher.publish_fact(&finished(id)).await.unwrap();
        publisher.publish_fact(&Fact::PlayEncouragement).await.unwrap();

        let transient = channel.transient.lock().unwrap().clone();
        assert_eq!(
            transient,
            vec![
                started.encode().unwrap(),
                finished(id).encode().unwrap(),
                Fact::PlayEncouragement.encode().unwrap(),
            ]
        );

        let durable = channel.durable.lock().unwrap().clone();
        assert_eq!(durable.len(), 2);
        assert_eq!(durable[0].1, started.encode().unwrap());
        assert_eq!(
            durable[1],
            (
                "training_finished".to_string(),
                finished(id).encode().unwrap()
            )
        );
    }

    #[tokio::test]
    async fn test_offline_peer_catches_up_in_order() {
        let ((watch, _), (phone, mut phone_rx)) = LoopbackChannel::pair();
        phone.set_listening(false);
        let publisher = DualChannelPublisher::new(Arc::new(watch));
        let id = Some(Uuid::new_v4());

        publisher
            .publish_fact(&Fact::TrainingStarted { session_id: id })
            .await
            .unwrap();
        publisher.publish_fact(&Fact::PlayEncouragement).await.unwrap();
        publisher.publish_fact(&finished(id)).await.unwrap();

        phone.set_listening(true);
        let mut normalizer = InboundNormalizer::new();
        let mut received = Vec::new();
        while let Ok(inbound) = phone_rx.try_recv() {
            received.extend(normalizer.accept(&inbound));
        }

        assert_eq!(
            received,
            vec![Fact::TrainingStarted { session_id: id }, finished(id)]
        );
    }

    #[tokio::test]
    async fn test_second_copy_is_dropped() {
        let ((watch, _), (_, mut phone_rx)) = LoopbackChannel::pair();
        let publisher = DualChannelPublisher::new(Arc::new(watch));
        let id = Some(Uuid::new_v4());

        publisher.publish_fact(&finished(id)).await.unwrap();

        let mut normalizer = InboundNormalizer::new();
        let first = phone_rx.recv().await.unwrap();
        let second = phone_rx.recv().await.unwrap();
        assert_ne!(first.path, second.path);
        assert_eq!(normalizer.accept(&first), Some(finished(id)));
        assert_eq!(normalizer.accept(&second), None);
    }

    #[test]
    fn test_anonymous_facts_pass_through() {
        let mut normalizer = InboundNormalizer::new();
        let inbound = Inbound {
            path: DeliveryPath::Transient,
            payload: finished(None).encode().unwrap(),
        };
        assert!(normalizer.accept(&inbound).is_some());
        assert!(normalizer.accept(&inbound).is_some());
    }

    #[test]
    fn test_malformed_payload_is_dropped() {
        let mut normalizer = InboundNormalizer::new();
        let inbound = Inbound {
            path: DeliveryPath::Durable,
            payload: b"{\"command\":\"training_finished\"}".to_vec(),
        };
        assert_eq!(normalizer.accept(&inbound), None);
    }

    #[tokio::test]
    async fn test_forward_publishes_remote_events_only() {
        let channel = Arc::new(FlakyChannel::default());
        let publisher = DualChannelPublisher::new(channel.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();

        for event in [
            SessionEvent::Started,
            SessionEvent::RepCompleted { index: 1 },
            SessionEvent::Finished {
                total_reps: 1,
                total_warnings: 0,
            },
        ] {
            tx.send(SessionFact { session_id, event }).unwrap();
        }
        drop(tx);
        publisher.forward(rx).await;

        let slots: Vec<String> = channel
            .durable
            .lock()
            .unwrap()
            .iter()
            .map(|(slot, _)| slot.clone())
            .collect();
        assert_eq!(slots, vec!["training_started", "training_finished"]);
    }
}
