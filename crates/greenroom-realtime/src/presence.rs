//! Presence tracking: who is currently connected to a room.
//!
//! The tracker joins a presence channel, announces the local identity once
//! the channel confirms the subscription, and thereafter mirrors the
//! channel's `sync` snapshots wholesale. Snapshots are authoritative and
//! total; the tracker never diffs or interpolates between them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::ChannelGuard;
use crate::error::{RealtimeError, RealtimeResult};
use crate::transport::RealtimeTransport;

/// One tracked identity on a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub identity: String,
    pub joined_at: SystemTime,
}

impl PresenceEntry {
    pub fn now(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            joined_at: SystemTime::now(),
        }
    }
}

/// Everyone currently tracked on a room, keyed by identity.
pub type PresenceSnapshot = BTreeMap<String, PresenceEntry>;

/// Tracker lifecycle. Snapshot arrivals do not change the phase; they update
/// the snapshot watch while the phase stays `Announced` (or `Subscribed`, if
/// the announce failed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresencePhase {
    Connecting,
    Subscribed,
    Announced,
    Left,
    Failed,
}

pub(crate) fn encode_sync(snapshot: &PresenceSnapshot) -> RealtimeResult<Bytes> {
    let envelope = serde_json::json!({
        "type": "sync",
        "payload": snapshot,
    });
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(|err| RealtimeError::Transport(format!("serialize presence sync failed: {err}")))
}

pub(crate) fn decode_sync(payload: &[u8]) -> RealtimeResult<PresenceSnapshot> {
    #[derive(Deserialize)]
    struct SyncEnvelope {
        #[serde(rename = "type")]
        kind: String,
        payload: PresenceSnapshot,
    }
    let envelope: SyncEnvelope = serde_json::from_slice(payload)
        .map_err(|err| RealtimeError::Transport(format!("invalid presence envelope: {err}")))?;
    if envelope.kind != "sync" {
        return Err(RealtimeError::Transport(format!(
            "unexpected presence message type {}",
            envelope.kind
        )));
    }
    Ok(envelope.payload)
}

/// Live view of one presence room, owned by the component that joined it.
pub struct PresenceHandle {
    phase: watch::Receiver<PresencePhase>,
    snapshot: watch::Receiver<PresenceSnapshot>,
    guard: ChannelGuard,
}

impl PresenceHandle {
    pub fn phase(&self) -> PresencePhase {
        *self.phase.borrow()
    }

    /// Identities in the most recent snapshot. Before the first snapshot
    /// arrives this is empty.
    pub fn online(&self) -> Vec<String> {
        self.snapshot.borrow().keys().cloned().collect()
    }

    pub fn online_count(&self) -> usize {
        self.snapshot.borrow().len()
    }

    pub fn snapshot(&self) -> PresenceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver over snapshots, for callers that want to react to
    /// membership changes rather than poll.
    pub fn watch_snapshot(&self) -> watch::Receiver<PresenceSnapshot> {
        self.snapshot.clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<PresencePhase> {
        self.phase.clone()
    }

    /// Detach from the room. Withdraws the local identity, stops applying
    /// snapshots (late deliveries are ignored), and is safe to call at any
    /// point after join, including before the channel reported subscribed.
    /// Idempotent.
    pub async fn leave(&mut self) {
        self.guard.close().await;
    }
}

pub(crate) fn join(
    transport: Arc<dyn RealtimeTransport>,
    room: impl Into<String>,
    identity: impl Into<String>,
) -> PresenceHandle {
    let room = room.into();
    let identity = identity.into();
    let channel_id = Uuid::new_v4();

    let (phase_tx, phase_rx) = watch::channel(PresencePhase::Connecting);
    let (snapshot_tx, snapshot_rx) = watch::channel(PresenceSnapshot::new());
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(run_tracker(
        transport,
        room,
        identity,
        channel_id,
        phase_tx,
        snapshot_tx,
        shutdown_rx,
    ));

    PresenceHandle {
        phase: phase_rx,
        snapshot: snapshot_rx,
        guard: ChannelGuard::new(shutdown_tx, task),
    }
}

async fn run_tracker(
    transport: Arc<dyn RealtimeTransport>,
    room: String,
    identity: String,
    channel_id: Uuid,
    phase: watch::Sender<PresencePhase>,
    snapshot: watch::Sender<PresenceSnapshot>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut events = tokio::select! {
        biased;
        _ = &mut shutdown => {
            let _ = phase.send(PresencePhase::Left);
            return;
        }
        opened = transport.open_presence(&room) => match opened {
            Ok(rx) => rx,
            Err(err) => {
                warn!(
                    target = "realtime.presence",
                    channel_id = %channel_id,
                    room = %room,
                    error = %err,
                    "presence channel failed to open"
                );
                let _ = phase.send(PresencePhase::Failed);
                return;
            }
        },
    };
    let _ = phase.send(PresencePhase::Subscribed);
    debug!(
        target = "realtime.presence",
        channel_id = %channel_id,
        room = %room,
        identity = %identity,
        "presence channel subscribed"
    );

    // Announce exactly once. A failed announce is non-fatal: snapshots keep
    // flowing, but the local identity may be absent until the caller rejoins.
    tokio::select! {
        biased;
        _ = &mut shutdown => {
            let _ = transport.untrack(&room, &identity).await;
            let _ = phase.send(PresencePhase::Left);
            return;
        }
        announced = transport.track(&room, PresenceEntry::now(identity.clone())) => {
            match announced {
                Ok(()) => {
                    let _ = phase.send(PresencePhase::Announced);
                }
                Err(err) => {
                    warn!(
                        target = "realtime.presence",
                        channel_id = %channel_id,
                        room = %room,
                        identity = %identity,
                        error = %err,
                        "presence announce failed"
                    );
                }
            }
        }
    }

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                let _ = transport.untrack(&room, &identity).await;
                let _ = phase.send(PresencePhase::Left);
                return;
            }
            delivery = events.recv() => match delivery {
                Ok(msg) => match decode_sync(&msg.payload) {
                    Ok(state) => {
                        let _ = snapshot.send(state);
                    }
                    Err(err) => {
                        warn!(
                            target = "realtime.presence",
                            channel_id = %channel_id,
                            room = %room,
                            error = %err,
                            "dropping malformed presence message"
                        );
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The next snapshot is total, so nothing is lost for good.
                    warn!(
                        target = "realtime.presence",
                        channel_id = %channel_id,
                        room = %room,
                        skipped,
                        "presence subscriber lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(
                        target = "realtime.presence",
                        channel_id = %channel_id,
                        room = %room,
                        "presence channel closed by transport"
                    );
                    let _ = phase.send(PresencePhase::Failed);
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_round_trip() {
        let mut snapshot = PresenceSnapshot::new();
        snapshot.insert("u1".into(), PresenceEntry::now("u1"));
        let decoded = decode_sync(&encode_sync(&snapshot).expect("encode")).expect("decode");
        assert_eq!(decoded.keys().collect::<Vec<_>>(), vec!["u1"]);
    }

    #[test]
    fn rejects_non_sync_messages() {
        let raw = serde_json::json!({"type": "diff", "payload": {}});
        let err = decode_sync(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
        assert!(matches!(err, RealtimeError::Transport(_)));
    }
}
