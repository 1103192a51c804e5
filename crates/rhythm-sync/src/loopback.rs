//! In-process channel pair.
//!
//! Each side can be marked as not listening (asleep, out of range). Transient
//! sends to a side that is not listening fail; durable values wait in that
//! side's slots and are handed over when it starts listening again.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::channel::{ChannelError, DeliveryPath, DurableSlots, Inbound, SyncChannel};

struct Side {
    inbox: mpsc::UnboundedSender<Inbound>,
    listening: bool,
    /// Durable values waiting for this side
    pending: DurableSlots,
}

impl Side {
    fn hand_over_pending(&mut self) {
        for (slot, payload) in self.pending.drain() {
            let inbound = Inbound {
                path: DeliveryPath::Durable,
                payload,
            };
            if self.inbox.send(inbound).is_err() {
                log::debug!("Loopback inbox closed, dropping durable `{slot}`");
            }
        }
    }
}

struct Link {
    sides: [Side; 2],
}

/// One end of an in-memory link
#[derive(Clone)]
pub struct LoopbackChannel {
    link: Arc<Mutex<Link>>,
    local: usize,
}

/// One end plus the receiver its peer delivers into
pub type LoopbackEnd = (LoopbackChannel, mpsc::UnboundedReceiver<Inbound>);

impl LoopbackChannel {
    /// Two connected ends, both listening
    #[must_use]
    pub fn pair() -> (LoopbackEnd, LoopbackEnd) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let side = |inbox| Side {
            inbox,
            listening: true,
            pending: DurableSlots::new(),
        };
        let link = Arc::new(Mutex::new(Link {
            sides: [side(a_tx), side(b_tx)],
        }));

        (
            (
                Self {
                    link: link.clone(),
                    local: 0,
                },
                a_rx,
            ),
            (Self { link, local: 1 }, b_rx),
        )
    }

    /// Mark this end as listening or not. Coming back receives pending durable values.
    pub fn set_listening(&self, listening: bool) {
        let Ok(mut link) = self.lock() else {
            return;
        };
        let side = &mut link.sides[self.local];
        side.listening = listening;
        if listening {
            side.hand_over_pending();
        }
    }

    /// Durable values this end has published that the peer has not picked up
    #[must_use]
    pub fn pending_for_peer(&self) -> usize {
        self.lock()
            .map(|link| link.sides[self.peer()].pending.len())
            .unwrap_or(0)
    }

    const fn peer(&self) -> usize {
        1 - self.local
    }

    fn lock(&self) -> Result<MutexGuard<'_, Link>, ChannelError> {
        self.link.lock().map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl SyncChannel for LoopbackChannel {
    async fn send_transient(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let link = self.lock()?;
        let peer = &link.sides[self.peer()];
        if !peer.listening {
            return Err(ChannelError::Unreachable);
        }
        peer.inbox
            .send(Inbound {
                path: DeliveryPath::Transient,
                payload: payload.to_vec(),
            })
            .map_err(|_| ChannelError::Closed)
    }

    async fn publish_durable(&self, slot: &str, payload: &[u8]) -> Result<(), ChannelError> {
        let mut link = self.lock()?;
        let peer = &mut link.sides[self.peer()];
        peer.pending.put(slot, payload);
        if peer.listening {
            peer.hand_over_pending();
        }
        Ok(())
    }

    fn reachable(&self) -> bool {
        self.lock()
            .map(|link| link.sides[self.peer()].listening)
            .unwrap_or(false)
    }

    fn name(&self) -> &'static str {
        "loopback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transient_reaches_listening_peer() {
        let ((watch, _), (_, mut phone_rx)) = LoopbackChannel::pair();

        assert!(watch.reachable());
        watch.send_transient(b"hello").await.unwrap();

        let inbound = phone_rx.recv().await.unwrap();
        assert_eq!(inbound.path, DeliveryPath::Transient);
        assert_eq!(inbound.payload, b"hello");
    }

    #[tokio::test]
    async fn test_transient_fails_when_peer_asleep() {
        let ((watch, _), (phone, mut phone_rx)) = LoopbackChannel::pair();
        phone.set_listening(false);

        assert!(!watch.reachable());
        assert!(matches!(
            watch.send_transient(b"lost").await,
            Err(ChannelError::Unreachable)
        ));
        assert!(phone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_durable_waits_for_next_contact() {
        let ((watch, _), (phone, mut phone_rx)) = LoopbackChannel::pair();
        phone.set_listening(false);

        watch.publish_durable("training_finished", b"v1").await.unwrap();
        watch.publish_durable("training_finished", b"v2").await.unwrap();
        assert_eq!(watch.pending_for_peer(), 1);
        assert!(phone_rx.try_recv().is_err());

        phone.set_listening(true);
        let inbound = phone_rx.recv().await.unwrap();
        assert_eq!(inbound.path, DeliveryPath::Durable);
        assert_eq!(inbound.payload, b"v2");
        assert!(phone_rx.try_recv().is_err());
        assert_eq!(watch.pending_for_peer(), 0);
    }

    #[tokio::test]
    async fn test_durable_is_immediate_when_peer_listening() {
        let ((watch, mut watch_rx), (phone, _)) = LoopbackChannel::pair();

        phone.publish_durable("start", b"go").await.unwrap();
        let inbound = watch_rx.recv().await.unwrap();
        assert_eq!(inbound.path, DeliveryPath::Durable);
        assert_eq!(phone.pending_for_peer(), 0);
        assert_eq!(watch.name(), "loopback");
    }
}
