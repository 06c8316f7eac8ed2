//! # Greenroom Realtime
//!
//! Realtime data synchronization for the Greenroom client: change-feed
//! subscriptions that keep local collections consistent with remote tables,
//! and presence tracking for discussion rooms.
//!
//! ## Example
//!
//! ```no_run
//! use greenroom_realtime::{FeedScope, Keyed, RealtimeClient};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Clone, Deserialize)]
//! struct Post {
//!     id: String,
//!     body: String,
//! }
//!
//! impl Keyed for Post {
//!     fn key(&self) -> &str {
//!         &self.id
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let local = RealtimeClient::local();
//!     let feed = local.client.feed::<Post>(FeedScope::table("posts")).await;
//!     let mut presence = local.client.presence("room-1", "u1").await;
//!     // ... render feed.rows() and presence.online() ...
//!     presence.leave().await;
//! }
//! ```

pub mod channel;
pub mod client;
pub mod collection;
pub mod error;
pub mod event;
pub mod feed;
pub mod presence;
pub mod store;
pub mod transport;

pub use channel::ChannelStatus;
pub use client::{LocalRuntime, RealtimeClient};
pub use collection::{Keyed, LocalCollection};
pub use error::{RealtimeError, RealtimeResult};
pub use event::{ChangeEvent, ChangeKind, FeedFilter, FeedScope};
pub use feed::FeedHandle;
pub use presence::{PresenceEntry, PresenceHandle, PresencePhase, PresenceSnapshot};
pub use store::{MemoryTables, RestConfig, RestRowSource, RowSource};
pub use transport::{LocalTransport, RealtimeTransport};
