use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use feed_bus::{Bus, BusMessage};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::timeout;

use greenroom_realtime::{
    ChangeEvent, ChannelStatus, FeedScope, Keyed, PresenceEntry, RealtimeClient, RealtimeError,
    RealtimeResult, RealtimeTransport, RowSource,
};

const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Post {
    id: String,
    likes: u32,
}

impl Keyed for Post {
    fn key(&self) -> &str {
        &self.id
    }
}

struct UnavailableRows;

#[async_trait]
impl RowSource for UnavailableRows {
    async fn fetch_rows(&self, _scope: &FeedScope) -> RealtimeResult<Vec<Value>> {
        Err(RealtimeError::Fetch("database unreachable".into()))
    }
}

async fn wait_for_rows<F>(feed: &greenroom_realtime::FeedHandle<Post>, predicate: F) -> Vec<Post>
where
    F: Fn(&[Post]) -> bool,
{
    let mut rows = feed.watch_rows();
    let matched = timeout(WAIT, rows.wait_for(|rows| predicate(rows)))
        .await
        .expect("rows timeout")
        .expect("rows watch alive")
        .clone();
    matched
}

#[tokio::test]
async fn feed_follows_insert_update_delete() {
    let local = RealtimeClient::local();
    local.tables.upsert("posts", json!({"id": "a", "likes": 1}));

    let scope = FeedScope::table("posts");
    let feed = local.client.feed::<Post>(scope.clone()).await;

    let seeded = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(seeded[0].likes, 1);

    local
        .transport
        .emit(&scope, &ChangeEvent::update(json!({"id": "a", "likes": 2})))
        .expect("emit update");
    let updated = wait_for_rows(&feed, |rows| rows.first().map(|p| p.likes) == Some(2)).await;
    assert_eq!(updated.len(), 1);

    local
        .transport
        .emit(&scope, &ChangeEvent::delete(json!({"id": "a"})))
        .expect("emit delete");
    wait_for_rows(&feed, |rows| rows.is_empty()).await;

    local
        .transport
        .emit(&scope, &ChangeEvent::insert(json!({"id": "b", "likes": 0})))
        .expect("emit insert");
    let fresh = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(fresh, vec![Post { id: "b".into(), likes: 0 }]);
}

#[tokio::test]
async fn update_for_unknown_id_inserts() {
    let local = RealtimeClient::local();
    let scope = FeedScope::table("posts");
    let feed = local.client.feed::<Post>(scope.clone()).await;

    let mut status = feed.watch_status();
    timeout(WAIT, status.wait_for(|s| *s == ChannelStatus::Subscribed))
        .await
        .expect("status timeout")
        .expect("status watch alive");

    local
        .transport
        .emit(&scope, &ChangeEvent::update(json!({"id": "early", "likes": 7})))
        .expect("emit update");
    let rows = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(rows[0].id, "early");
    assert_eq!(rows[0].likes, 7);
}

#[tokio::test]
async fn filtered_feed_only_sees_its_slice() {
    let local = RealtimeClient::local();
    local
        .tables
        .upsert("messages", json!({"id": "m1", "room_id": "room-1", "likes": 0}));
    local
        .tables
        .upsert("messages", json!({"id": "m2", "room_id": "room-2", "likes": 0}));

    let scoped = FeedScope::filtered("messages", "room_id", "room-1");
    let feed = local.client.feed::<Post>(scoped.clone()).await;

    let seeded = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(seeded.len(), 1);
    assert_eq!(seeded[0].id, "m1");

    // An event published on the other room's topic never reaches this feed.
    let other = FeedScope::filtered("messages", "room_id", "room-2");
    local
        .transport
        .emit(&other, &ChangeEvent::insert(json!({"id": "m3", "room_id": "room-2", "likes": 0})))
        .expect("emit other room");
    local
        .transport
        .emit(&scoped, &ChangeEvent::insert(json!({"id": "m4", "room_id": "room-1", "likes": 0})))
        .expect("emit this room");

    let rows = wait_for_rows(&feed, |rows| rows.len() == 2).await;
    assert!(rows.iter().all(|row| row.id != "m3"));
}

#[tokio::test]
async fn malformed_events_are_dropped_not_fatal() {
    let local = RealtimeClient::local();
    let scope = FeedScope::table("posts");
    let feed = local.client.feed::<Post>(scope.clone()).await;

    let mut status = feed.watch_status();
    timeout(WAIT, status.wait_for(|s| *s == ChannelStatus::Subscribed))
        .await
        .expect("status timeout")
        .expect("status watch alive");

    let topic = scope.topic();
    local
        .transport
        .bus()
        .publish(&topic, Bytes::from_static(b"not json"))
        .expect("publish garbage");
    // Delete without an id is dropped at the boundary.
    local
        .transport
        .emit(&scope, &ChangeEvent::delete(json!({"likes": 1})))
        .expect("emit idless delete");
    local
        .transport
        .emit(&scope, &ChangeEvent::insert(json!({"id": "ok", "likes": 1})))
        .expect("emit valid insert");

    let rows = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(rows, vec![Post { id: "ok".into(), likes: 1 }]);

    // Dropped deliveries never wake the rows watch.
    let mut watcher = feed.watch_rows();
    watcher.borrow_and_update();
    local
        .transport
        .bus()
        .publish(&topic, Bytes::from_static(b"more garbage"))
        .expect("publish garbage");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!watcher.has_changed().expect("watch alive"));
}

/// Hands the feed a subscription that is already over capacity, so the first
/// receive reports a lag.
struct FloodingTransport {
    feed_tx: broadcast::Sender<BusMessage>,
}

impl FloodingTransport {
    fn new() -> Self {
        Self {
            feed_tx: broadcast::channel(4).0,
        }
    }
}

#[async_trait]
impl RealtimeTransport for FloodingTransport {
    async fn open_feed(
        &self,
        scope: &FeedScope,
    ) -> RealtimeResult<broadcast::Receiver<BusMessage>> {
        let rx = self.feed_tx.subscribe();
        for n in 0..8 {
            let event = ChangeEvent::insert(json!({"id": format!("e{n}"), "likes": 0}));
            let _ = self.feed_tx.send(BusMessage {
                topic: scope.topic(),
                payload: event.encode().expect("encode"),
            });
        }
        Ok(rx)
    }

    async fn open_presence(&self, _room: &str) -> RealtimeResult<broadcast::Receiver<BusMessage>> {
        Err(RealtimeError::Transport("presence unsupported".into()))
    }

    async fn track(&self, _room: &str, _entry: PresenceEntry) -> RealtimeResult<()> {
        Err(RealtimeError::Transport("presence unsupported".into()))
    }

    async fn untrack(&self, _room: &str, _identity: &str) -> RealtimeResult<()> {
        Err(RealtimeError::Transport("presence unsupported".into()))
    }
}

/// Empty on the first read, authoritative afterwards, so only a re-run of
/// the seed fetch can surface the `truth` row.
#[derive(Default)]
struct RecoveringRows {
    calls: AtomicUsize,
}

#[async_trait]
impl RowSource for RecoveringRows {
    async fn fetch_rows(&self, _scope: &FeedScope) -> RealtimeResult<Vec<Value>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Vec::new())
        } else {
            Ok(vec![json!({"id": "truth", "likes": 9})])
        }
    }
}

#[tokio::test]
async fn lagged_feed_refetches_to_converge() {
    let client = RealtimeClient::new(
        Arc::new(FloodingTransport::new()),
        Arc::new(RecoveringRows::default()),
    );
    let feed = client.feed::<Post>(FeedScope::table("posts")).await;

    // The lag drops the oldest events; the worker's own refetch restores the
    // baseline and the still-buffered tail applies on top of it.
    let rows = wait_for_rows(&feed, |rows| {
        rows.iter().any(|p| p.id == "truth") && rows.iter().any(|p| p.id == "e7")
    })
    .await;
    assert!(rows.iter().all(|p| p.id != "e0"));
}

#[tokio::test]
async fn failed_seed_keeps_subscription_alive() {
    let local = RealtimeClient::local();
    let client = RealtimeClient::new(local.transport.clone(), Arc::new(UnavailableRows));

    let scope = FeedScope::table("posts");
    let feed = client.feed::<Post>(scope.clone()).await;

    let mut fetch_error = feed.watch_fetch_error();
    timeout(WAIT, fetch_error.wait_for(|err| err.is_some()))
        .await
        .expect("fetch error timeout")
        .expect("fetch error watch alive");
    assert!(feed.rows().is_empty());

    // Events still populate state even though the seed failed.
    local
        .transport
        .emit(&scope, &ChangeEvent::insert(json!({"id": "live", "likes": 3})))
        .expect("emit insert");
    let rows = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(rows[0].id, "live");
}

#[tokio::test]
async fn refetch_replaces_collection_and_clears_error() {
    let local = RealtimeClient::local();
    let scope = FeedScope::table("posts");
    let feed = local.client.feed::<Post>(scope.clone()).await;

    wait_for_rows(&feed, |rows| rows.is_empty()).await;

    // Rows written behind the feed's back only show up after a refetch.
    local.tables.upsert("posts", json!({"id": "a", "likes": 4}));
    feed.refetch().await.expect("refetch");
    let rows = wait_for_rows(&feed, |rows| !rows.is_empty()).await;
    assert_eq!(rows, vec![Post { id: "a".into(), likes: 4 }]);
    assert_eq!(feed.fetch_error(), None);
}

#[tokio::test]
async fn close_is_safe_and_idempotent() {
    let local = RealtimeClient::local();
    let scope = FeedScope::table("posts");
    let mut feed = local.client.feed::<Post>(scope.clone()).await;

    // Close immediately, possibly before the subscription is confirmed.
    feed.close().await;
    assert_eq!(feed.status(), ChannelStatus::Closed);
    feed.close().await;
    assert_eq!(feed.status(), ChannelStatus::Closed);

    // Events delivered after close never surface.
    local
        .transport
        .emit(&scope, &ChangeEvent::insert(json!({"id": "late", "likes": 1})))
        .expect("emit after close");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(feed.rows().is_empty());

    // Refetch on a closed feed reports the closure instead of panicking.
    assert!(matches!(feed.refetch().await, Err(RealtimeError::Closed)));
}

#[tokio::test]
async fn two_feeds_on_one_table_are_independent() {
    let local = RealtimeClient::local();
    let scope = FeedScope::table("posts");
    let mut one = local.client.feed::<Post>(scope.clone()).await;
    let two = local.client.feed::<Post>(scope.clone()).await;

    let mut status = two.watch_status();
    timeout(WAIT, status.wait_for(|s| *s == ChannelStatus::Subscribed))
        .await
        .expect("status timeout")
        .expect("status watch alive");

    one.close().await;

    local
        .transport
        .emit(&scope, &ChangeEvent::insert(json!({"id": "x", "likes": 1})))
        .expect("emit");
    let rows = wait_for_rows(&two, |rows| !rows.is_empty()).await;
    assert_eq!(rows[0].id, "x");
    assert!(one.rows().is_empty());
}
