//! In-process topic bus used by the realtime layer.
//!
//! Change feeds and presence rooms are both addressed as named topics. The
//! bus only guarantees per-topic delivery order for a single subscriber; it
//! performs no replay, so consumers that need a baseline must seed themselves
//! before (or immediately after) subscribing.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod topic;

/// Number of messages buffered per topic before slow subscribers lag.
pub const TOPIC_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// In-memory bus backing the local transport and the test suites.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a topic. Zero also covers topics that
    /// were never subscribed.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        // A publish with no subscribers is not an error: feeds may publish
        // before any component has mounted.
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(_) => Ok(()),
            Err(_) if sender.receiver_count() == 0 => Ok(()),
            Err(_) => Err(BusError::Closed),
        }
    }
}
