use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

/// Transport path a payload arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryPath {
    /// Immediate, lost if the peer was not listening
    Transient,
    /// Last-value-wins, picked up on next contact
    Durable,
}

/// Payload delivered by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub path: DeliveryPath,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("peer is not reachable")]
    Unreachable,

    #[error("channel closed")]
    Closed,

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame encoding error: {0}")]
    Frame(#[from] bincode::Error),
}

/// Bidirectional link to the paired device.
///
/// Implementations surface inbound payloads (from both paths) on an
/// `mpsc` receiver handed out when the channel is created.
#[async_trait]
pub trait SyncChannel: Send + Sync {
    /// Best-effort immediate delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is not listening right now. Callers on
    /// the session path log and drop it.
    async fn send_transient(&self, payload: &[u8]) -> Result<(), ChannelError>;

    /// Store `payload` as the latest value of `slot` for eventual delivery.
    ///
    /// A later publish to the same slot replaces an undelivered earlier one.
    /// Success means accepted, not delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if the value could not be accepted locally.
    async fn publish_durable(&self, slot: &str, payload: &[u8]) -> Result<(), ChannelError>;

    /// Advisory reachability; may be stale
    fn reachable(&self) -> bool;

    /// Transport name for logs
    fn name(&self) -> &'static str;
}

/// Undelivered durable values, at most one per slot.
///
/// Kept in order of their latest write, so a receiver that catches up sees
/// facts in the order they were last published.
#[derive(Debug, Default, Clone)]
pub struct DurableSlots {
    entries: VecDeque<(String, Vec<u8>)>,
}

impl DurableSlots {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `payload` for `slot`, replacing any undelivered value.
    pub fn put(&mut self, slot: &str, payload: &[u8]) {
        self.entries.retain(|(name, _)| name != slot);
        self.entries.push_back((slot.to_string(), payload.to_vec()));
    }

    /// Oldest pending value
    #[must_use]
    pub fn front(&self) -> Option<&(String, Vec<u8>)> {
        self.entries.front()
    }

    pub fn pop_front(&mut self) -> Option<(String, Vec<u8>)> {
        self.entries.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, Vec<u8>)> + '_ {
        self.entries.drain(..)
    }

    #[must_use]
    pub fn get(&self, slot: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(name, _)| name == slot)
            .map(|(_, payload)| payload.as_slice())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
