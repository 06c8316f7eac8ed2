//! Transport seam between the sync layer and the realtime backend.
//!
//! The hosted deployment implements [`RealtimeTransport`] against the
//! platform's socket; [`LocalTransport`] implements it over the in-process
//! [`feed_bus::LocalBus`] for tests, the demo app, and offline development.
//! Either way the sync layer only sees confirmed subscriptions delivering
//! enveloped payloads in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use feed_bus::{topic, Bus, BusMessage, LocalBus};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{RealtimeError, RealtimeResult};
use crate::event::{ChangeEvent, FeedScope};
use crate::presence::{encode_sync, PresenceEntry, PresenceSnapshot};

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a confirmed change-feed subscription for a scope.
    async fn open_feed(&self, scope: &FeedScope)
        -> RealtimeResult<broadcast::Receiver<BusMessage>>;

    /// Open a confirmed presence subscription for a room.
    async fn open_presence(&self, room: &str) -> RealtimeResult<broadcast::Receiver<BusMessage>>;

    /// Announce the local identity on a room.
    async fn track(&self, room: &str, entry: PresenceEntry) -> RealtimeResult<()>;

    /// Withdraw an identity from a room.
    async fn untrack(&self, room: &str, identity: &str) -> RealtimeResult<()>;
}

/// In-process transport over [`LocalBus`].
///
/// Presence is emulated with an authoritative per-room registry: every track
/// and untrack rebroadcasts the room's full snapshot, matching the hosted
/// channel's total `sync` notifications.
#[derive(Default)]
pub struct LocalTransport {
    bus: Arc<LocalBus>,
    rooms: parking_lot::Mutex<HashMap<String, PresenceSnapshot>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus(&self) -> &Arc<LocalBus> {
        &self.bus
    }

    /// Publish a change event onto a feed topic. Used by local producers:
    /// tests, the demo app, and in-process write paths.
    pub fn emit(&self, scope: &FeedScope, event: &ChangeEvent) -> RealtimeResult<()> {
        let payload = event.encode()?;
        self.bus
            .publish(&scope.topic(), payload)
            .map_err(|err| RealtimeError::Transport(err.to_string()))
    }

    fn broadcast_room(&self, room: &str, snapshot: &PresenceSnapshot) -> RealtimeResult<()> {
        let payload = encode_sync(snapshot)?;
        self.bus
            .publish(&topic::presence(room), payload)
            .map_err(|err| RealtimeError::Transport(err.to_string()))
    }
}

#[async_trait]
impl RealtimeTransport for LocalTransport {
    async fn open_feed(
        &self,
        scope: &FeedScope,
    ) -> RealtimeResult<broadcast::Receiver<BusMessage>> {
        let topic = scope.topic();
        debug!(target = "realtime.transport", topic = %topic, "feed subscription opened");
        Ok(self.bus.subscribe(&topic))
    }

    async fn open_presence(&self, room: &str) -> RealtimeResult<broadcast::Receiver<BusMessage>> {
        let rx = self.bus.subscribe(&topic::presence(room));
        {
            // Late joiners should not have to wait for the next membership
            // change to learn who is already in the room. The lock is held
            // across the publish so this snapshot cannot race a concurrent
            // track on the same room.
            let rooms = self.rooms.lock();
            match rooms.get(room) {
                Some(members) => self.broadcast_room(room, members)?,
                None => self.broadcast_room(room, &PresenceSnapshot::new())?,
            }
        }
        debug!(target = "realtime.transport", room = %room, "presence subscription opened");
        Ok(rx)
    }

    async fn track(&self, room: &str, entry: PresenceEntry) -> RealtimeResult<()> {
        // Publish while still holding the room lock: the broadcast send is
        // synchronous, and releasing first would let two concurrent tracks
        // deliver their snapshots in inverted order, leaving subscribers on
        // a stale total.
        let mut rooms = self.rooms.lock();
        let members = rooms.entry(room.to_string()).or_insert_with(BTreeMap::new);
        members.insert(entry.identity.clone(), entry);
        self.broadcast_room(room, members)
    }

    async fn untrack(&self, room: &str, identity: &str) -> RealtimeResult<()> {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(room) {
            Some(members) => {
                members.remove(identity);
                self.broadcast_room(room, members)
            }
            None => Ok(()),
        }
    }
}
