//! Process-wide realtime client.

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::collection::Keyed;
use crate::event::FeedScope;
use crate::feed::{self, FeedHandle};
use crate::presence::{self, PresenceHandle};
use crate::store::{MemoryTables, RowSource};
use crate::transport::{LocalTransport, RealtimeTransport};

/// One long-lived handle to the realtime backend.
///
/// Created once at application start and passed by clone to every
/// collaborator; never re-instantiated per call. Clones share the underlying
/// transport and row source.
#[derive(Clone)]
pub struct RealtimeClient {
    transport: Arc<dyn RealtimeTransport>,
    rows: Arc<dyn RowSource>,
}

impl RealtimeClient {
    pub fn new(transport: Arc<dyn RealtimeTransport>, rows: Arc<dyn RowSource>) -> Self {
        Self { transport, rows }
    }

    /// Fully in-process client for tests, demos, and offline development.
    pub fn local() -> LocalRuntime {
        let transport = Arc::new(LocalTransport::new());
        let tables = Arc::new(MemoryTables::new());
        let client = Self::new(transport.clone(), tables.clone());
        LocalRuntime {
            client,
            transport,
            tables,
        }
    }

    /// Open a change feed on a table slice. The handle owns the channel; the
    /// channel closes when the handle is closed or dropped.
    pub async fn feed<T>(&self, scope: FeedScope) -> FeedHandle<T>
    where
        T: Keyed + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        feed::open(self.transport.clone(), self.rows.clone(), scope)
    }

    /// Join a presence room as the given identity.
    pub async fn presence(
        &self,
        room: impl Into<String>,
        identity: impl Into<String>,
    ) -> PresenceHandle {
        presence::join(self.transport.clone(), room, identity)
    }
}

/// A [`RealtimeClient`] wired to in-process backends, with the transport and
/// tables exposed so callers can act as the producer side.
pub struct LocalRuntime {
    pub client: RealtimeClient,
    pub transport: Arc<LocalTransport>,
    pub tables: Arc<MemoryTables>,
}
