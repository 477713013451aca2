//! Error types for feed reconciliation

use thiserror::Error;

use crate::model::ChainId;

/// Result type for reconciler operations
pub type Result<T> = std::result::Result<T, FeedError>;

/// Terminal errors surfaced to the caller of a load.
///
/// Recoverable faults (a shard timing out, a forged identity record, an
/// exhausted backfill) never appear here; they are reported as
/// [`crate::reconcile::ReconcileWarning`]s on the published feed.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The request processor knows no shards for the application
    #[error("no shards available for {0}")]
    NoShards(String),

    /// Every shard timed out before reaching quorum
    #[error("all {0} shards timed out before reaching quorum")]
    AllShardsTimedOut(usize),

    /// An identifier string was not a 32-byte hex digest
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The caller passed a filter or argument the feed cannot serve
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A page token was supplied while another page is still being fetched
    #[error("page request already in flight")]
    PageInFlight,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    /// Stable error code delivered alongside the message to `on_error`.
    pub fn code(&self) -> &'static str {
        match self {
            FeedError::NoShards(_) => "E_CHAINS_ABSENT",
            FeedError::AllShardsTimedOut(_) => "E_TIMEOUT",
            FeedError::InvalidId(_) => "E_INVALID_ID",
            FeedError::InvalidArgument(_) => "E_INVALID_ARGUMENT",
            FeedError::PageInFlight => "E_PAGE_IN_FLIGHT",
            FeedError::Transport(_) => "E_TRANSPORT",
            FeedError::Config(_) | FeedError::Io(_) | FeedError::Toml(_) | FeedError::Json(_) => {
                "E_CONFIG"
            }
        }
    }

    /// Whether the error was caused by the caller rather than the network.
    pub fn is_caller_misuse(&self) -> bool {
        matches!(
            self,
            FeedError::InvalidId(_) | FeedError::InvalidArgument(_) | FeedError::PageInFlight
        )
    }
}

/// Failures raised by a [`crate::transport::RequestProcessor`] when it cannot
/// even dispatch a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown chain {0}")]
    UnknownChain(ChainId),

    #[error("no peers reachable for chain {0}")]
    Unavailable(ChainId),

    #[error("reply channel closed")]
    ChannelClosed,
}
