//! Change-feed synchronizer: keeps a local collection consistent with a
//! remote table slice.
//!
//! Events are applied strictly in delivery order by a single worker task, so
//! no handler ever observes a partially applied batch. The initial fetch is a
//! fail-safe baseline: it runs after the subscription is open, so rows that
//! change in the gap are covered either by the fetch or by a buffered event,
//! and re-applying both is harmless because application is keyed upserts.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::{ChannelGuard, ChannelStatus};
use crate::collection::{Keyed, LocalCollection};
use crate::error::RealtimeError;
use crate::event::{ChangeEvent, ChangeKind, FeedScope};
use crate::store::RowSource;
use crate::transport::RealtimeTransport;

enum FeedCommand {
    Refetch,
}

/// Live, exclusively owned view of one table slice.
///
/// The collection, its status, and the last fetch error are exposed as watch
/// channels so owners can poll or await changes. `close` tears the channel
/// down exactly once; after it resolves no further state updates occur.
pub struct FeedHandle<T> {
    rows: watch::Receiver<Vec<T>>,
    status: watch::Receiver<ChannelStatus>,
    fetch_error: watch::Receiver<Option<String>>,
    commands: mpsc::Sender<FeedCommand>,
    guard: ChannelGuard,
}

impl<T: Clone> FeedHandle<T> {
    pub fn rows(&self) -> Vec<T> {
        self.rows.borrow().clone()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Error from the most recent seed fetch, if it failed. Cleared by the
    /// next successful fetch. Distinct from an empty collection.
    pub fn fetch_error(&self) -> Option<String> {
        self.fetch_error.borrow().clone()
    }

    pub fn watch_rows(&self) -> watch::Receiver<Vec<T>> {
        self.rows.clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn watch_fetch_error(&self) -> watch::Receiver<Option<String>> {
        self.fetch_error.clone()
    }

    /// Re-run the seed fetch. On success the collection is replaced
    /// wholesale (the point-in-time read is authoritative) and the fetch
    /// error clears; on failure the collection keeps its prior state.
    pub async fn refetch(&self) -> Result<(), RealtimeError> {
        self.commands
            .send(FeedCommand::Refetch)
            .await
            .map_err(|_| RealtimeError::Closed)
    }

    /// Tear down the subscription. Idempotent; safe before `Subscribed`.
    pub async fn close(&mut self) {
        self.guard.close().await;
    }
}

pub(crate) fn open<T>(
    transport: Arc<dyn RealtimeTransport>,
    rows_source: Arc<dyn RowSource>,
    scope: FeedScope,
) -> FeedHandle<T>
where
    T: Keyed + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let channel_id = Uuid::new_v4();
    let (rows_tx, rows_rx) = watch::channel(Vec::new());
    let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
    let (error_tx, error_rx) = watch::channel(None);
    let (command_tx, command_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(run_feed(
        transport,
        rows_source,
        scope,
        channel_id,
        rows_tx,
        status_tx,
        error_tx,
        command_rx,
        shutdown_rx,
    ));

    FeedHandle {
        rows: rows_rx,
        status: status_rx,
        fetch_error: error_rx,
        commands: command_tx,
        guard: ChannelGuard::new(shutdown_tx, task),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_feed<T>(
    transport: Arc<dyn RealtimeTransport>,
    rows_source: Arc<dyn RowSource>,
    scope: FeedScope,
    channel_id: Uuid,
    rows: watch::Sender<Vec<T>>,
    status: watch::Sender<ChannelStatus>,
    fetch_error: watch::Sender<Option<String>>,
    mut commands: mpsc::Receiver<FeedCommand>,
    mut shutdown: oneshot::Receiver<()>,
) where
    T: Keyed + DeserializeOwned + Clone + Send + Sync + 'static,
{
    let mut events = tokio::select! {
        biased;
        _ = &mut shutdown => {
            let _ = status.send(ChannelStatus::Closed);
            return;
        }
        opened = transport.open_feed(&scope) => match opened {
            Ok(rx) => rx,
            Err(err) => {
                warn!(
                    target = "realtime.feed",
                    channel_id = %channel_id,
                    table = %scope.table,
                    error = %err,
                    "change feed failed to open"
                );
                let _ = status.send(ChannelStatus::Failed);
                return;
            }
        },
    };
    let _ = status.send(ChannelStatus::Subscribed);
    debug!(
        target = "realtime.feed",
        channel_id = %channel_id,
        table = %scope.table,
        "change feed subscribed"
    );

    let mut collection: LocalCollection<T> = LocalCollection::new();

    // Seed after subscribing so nothing slips between fetch and first event.
    // A failed seed leaves the collection untouched and the subscription
    // live; the owner sees the error and may call refetch.
    tokio::select! {
        biased;
        _ = &mut shutdown => {
            let _ = status.send(ChannelStatus::Closed);
            return;
        }
        fetched = rows_source.fetch_rows(&scope) => {
            seed(&scope, channel_id, fetched, &mut collection, &rows, &fetch_error);
        }
    }

    let mut commands_open = true;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                let _ = status.send(ChannelStatus::Closed);
                return;
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(FeedCommand::Refetch) => {
                        let fetched = rows_source.fetch_rows(&scope).await;
                        seed(&scope, channel_id, fetched, &mut collection, &rows, &fetch_error);
                    }
                    None => commands_open = false,
                }
            }
            delivery = events.recv() => match delivery {
                Ok(msg) => {
                    if apply_event(&scope, channel_id, &msg.payload, &mut collection) {
                        let _ = rows.send(collection.to_vec());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Missed events cannot be replayed; fall back to a fresh
                    // point-in-time read so the collection reconverges.
                    warn!(
                        target = "realtime.feed",
                        channel_id = %channel_id,
                        table = %scope.table,
                        skipped,
                        "feed subscriber lagged; refetching"
                    );
                    let fetched = rows_source.fetch_rows(&scope).await;
                    seed(&scope, channel_id, fetched, &mut collection, &rows, &fetch_error);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!(
                        target = "realtime.feed",
                        channel_id = %channel_id,
                        table = %scope.table,
                        "change feed closed by transport"
                    );
                    let _ = status.send(ChannelStatus::Failed);
                    return;
                }
            },
        }
    }
}

fn seed<T>(
    scope: &FeedScope,
    channel_id: Uuid,
    fetched: Result<Vec<Value>, RealtimeError>,
    collection: &mut LocalCollection<T>,
    rows: &watch::Sender<Vec<T>>,
    fetch_error: &watch::Sender<Option<String>>,
) where
    T: Keyed + DeserializeOwned + Clone,
{
    match fetched {
        Ok(raw_rows) => {
            let mut seeded = Vec::with_capacity(raw_rows.len());
            for raw in raw_rows {
                match serde_json::from_value::<T>(raw) {
                    Ok(row) => seeded.push(row),
                    Err(err) => warn!(
                        target = "realtime.feed",
                        channel_id = %channel_id,
                        table = %scope.table,
                        error = %err,
                        "dropping unreadable seed row"
                    ),
                }
            }
            collection.replace_all(seeded);
            let _ = rows.send(collection.to_vec());
            let _ = fetch_error.send(None);
        }
        Err(err) => {
            warn!(
                target = "realtime.feed",
                channel_id = %channel_id,
                table = %scope.table,
                error = %err,
                "seed fetch failed; keeping prior collection"
            );
            let _ = fetch_error.send(Some(err.to_string()));
        }
    }
}

/// Returns whether the collection changed, so callers only wake watchers
/// for deliveries that had an effect.
fn apply_event<T>(
    scope: &FeedScope,
    channel_id: Uuid,
    payload: &[u8],
    collection: &mut LocalCollection<T>,
) -> bool
where
    T: Keyed + DeserializeOwned + Clone,
{
    let event = match ChangeEvent::decode(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(
                target = "realtime.feed",
                channel_id = %channel_id,
                table = %scope.table,
                error = %err,
                "dropping malformed change event"
            );
            return false;
        }
    };

    match event.kind {
        ChangeKind::Insert | ChangeKind::Update => {
            let raw = match event.new_row {
                Some(raw) => raw,
                None => {
                    warn!(
                        target = "realtime.feed",
                        channel_id = %channel_id,
                        table = %scope.table,
                        kind = ?event.kind,
                        "dropping change event without a row snapshot"
                    );
                    return false;
                }
            };
            match serde_json::from_value::<T>(raw) {
                Ok(row) if event.kind == ChangeKind::Insert => {
                    collection.apply_insert(row);
                    true
                }
                Ok(row) => {
                    collection.apply_update(row);
                    true
                }
                Err(err) => {
                    warn!(
                        target = "realtime.feed",
                        channel_id = %channel_id,
                        table = %scope.table,
                        error = %err,
                        "dropping unreadable change event row"
                    );
                    false
                }
            }
        }
        ChangeKind::Delete => match event.entity_id() {
            Some(id) => collection.apply_delete(&id),
            None => {
                warn!(
                    target = "realtime.feed",
                    channel_id = %channel_id,
                    table = %scope.table,
                    "dropping delete event without an id"
                );
                false
            }
        },
    }
}
