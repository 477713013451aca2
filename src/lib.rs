//! Feed Reconciler - quorum-confirmed feeds over a sharded ledger
//!
//! A feed is assembled from many shards at once. Each shard is asked for the
//! same page by several independent peers, and only once every shard has
//! delivered the required number of confirmations (or given up) is the
//! result merged, backfilled, checked and published.
//!
//! ## Modules
//!
//! - **model**: identifiers, feed items, ordering keys
//! - **feed**: the merge engine (`FeedContainer`), merge policies, cursors
//!   and the four feed kinds
//! - **identity**: signed publisher identity records, trust checks, cache
//! - **reconcile**: quorum tracking, backfill, the round step machine and
//!   the async `FeedSession`
//! - **transport**: the `RequestProcessor` seam plus an in-process simulated
//!   network
//!
//! ## Example
//!
//! ```rust,ignore
//! let network = Arc::new(NetworkFixture::load(path)?.build()?);
//! let session = FeedSession::new(
//!     Arc::new(ContentFeed::subscriptions()),
//!     network,
//!     Arc::new(IdentityCache::with_defaults()),
//!     Config::default(),
//! );
//! let outcome = session.load(FeedFilter::Subscriptions, None).await?;
//! if let LoadOutcome::Published(report) = outcome {
//!     for entry in report.feed.iter() {
//!         println!("{}", entry.item.id);
//!     }
//! }
//! ```

pub mod config;
pub mod error;
pub mod feed;
pub mod identity;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod transport;

pub use config::Config;
pub use error::{FeedError, Result, TransportError};
pub use feed::{
    ContentFeed, ConversationFeed, FeedContainer, FeedEvent, FeedFilter, FeedProfile, FeedSnapshot,
    PageToken, ReactionFeed, TagFeed,
};
pub use identity::IdentityCache;
pub use model::{ChainId, FeedItem, Hash256, ItemId, ItemKind};
pub use reconcile::{FeedReport, FeedSession, LoadOutcome, ReconcileWarning};
pub use transport::{MemoryNetwork, NetworkFixture, RequestProcessor};
