//! Shared channel lifecycle plumbing.

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Lifecycle of one open channel, as observed by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Channel requested but the transport has not confirmed it yet.
    Connecting,
    /// Transport confirmed the subscription; events are flowing.
    Subscribed,
    /// The transport failed to open the channel or dropped it. The owner
    /// decides whether to retry; this layer does not reconnect.
    Failed,
    /// Channel torn down; no further state updates will be observed.
    Closed,
}

/// Exclusive ownership of one channel worker task.
///
/// Close is explicit and exactly-once: the first call signals the worker and
/// waits for it to finish, later calls are no-ops. Dropping an unclosed guard
/// aborts the worker so no callbacks outlive the owner either way. Safe to
/// close at any point after creation, including before the transport reports
/// `Subscribed`.
#[derive(Debug)]
pub struct ChannelGuard {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelGuard {
    pub fn new(shutdown: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
            task: Some(task),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Signal the worker and wait for it to run down. Idempotent.
    pub async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The worker may already be gone; a dead receiver is fine.
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
