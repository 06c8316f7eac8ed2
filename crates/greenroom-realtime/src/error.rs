use thiserror::Error;

/// Error taxonomy for the realtime layer.
///
/// `Fetch` is distinct from an empty result set: a feed whose seed query
/// fails keeps its previous collection so partial UI stays usable, while a
/// feed whose seed query returns no rows is simply empty. Malformed events
/// never appear here; they are dropped and logged at the boundary.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("initial fetch failed: {0}")]
    Fetch(String),
    #[error("channel closed")]
    Closed,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;
