//! Request processor collaborator and reply handles.
//!
//! The reconciler never talks to the network itself. It hands requests to a
//! [`RequestProcessor`] together with a reply handle; the processor answers
//! through the handle from whatever task it likes. Every reply lands on the
//! owning session's event channel, so handlers run one at a time.

mod fixture;
mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::feed::{FeedRequest, ShardResponse};
use crate::identity::PublisherIdentityRecord;
use crate::model::{ChainId, FeedItem, ItemId, PeerId};
use crate::reconcile::SessionEvent;

pub use fixture::{
    BehaviorFixture, IdentityFixture, ItemFixture, NetworkFixture, PeerFixture, ShardFixture,
};
pub use memory::{MemoryNetwork, MemoryShard, PeerBehavior};

/// Handle to a dispatched scatter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Answers to one shard's scatter request. One `partial` per responding peer.
#[derive(Debug, Clone)]
pub struct ScatterReply {
    chain_id: ChainId,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ScatterReply {
    pub fn new(chain_id: ChainId, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { chain_id, events }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Deliver one peer's items. Returns false once the session has gone.
    pub fn partial(&self, peer: impl Into<PeerId>, items: Vec<FeedItem>) -> bool {
        self.events
            .send(SessionEvent::Partial(ShardResponse::new(self.chain_id, peer, items)))
            .is_ok()
    }

    /// The shard will not deliver any more confirmations.
    pub fn timeout(&self) -> bool {
        self.events
            .send(SessionEvent::ShardTimeout {
                chain_id: self.chain_id,
            })
            .is_ok()
    }
}

/// Answer to one backfill batch.
#[derive(Debug)]
pub struct ContentReply {
    chain_id: ChainId,
    round: usize,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ContentReply {
    pub fn new(
        chain_id: ChainId,
        round: usize,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            chain_id,
            round,
            events,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn loaded(self, items: Vec<FeedItem>) -> bool {
        self.events
            .send(SessionEvent::ContentLoaded {
                chain_id: self.chain_id,
                round: self.round,
                items,
            })
            .is_ok()
    }

    pub fn timeout(self) -> bool {
        self.events
            .send(SessionEvent::ContentTimeout {
                chain_id: self.chain_id,
                round: self.round,
            })
            .is_ok()
    }
}

/// Answer to one identity batch.
#[derive(Debug)]
pub struct IdentityReply {
    chain_id: ChainId,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl IdentityReply {
    pub fn new(chain_id: ChainId, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { chain_id, events }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn loaded(self, records: Vec<PublisherIdentityRecord>) -> bool {
        self.events
            .send(SessionEvent::IdentitiesLoaded {
                chain_id: self.chain_id,
                records,
            })
            .is_ok()
    }

    pub fn timeout(self) -> bool {
        self.events
            .send(SessionEvent::IdentityTimeout {
                chain_id: self.chain_id,
            })
            .is_ok()
    }
}

/// Network-facing collaborator used by feed sessions.
///
/// # Example
///
/// ```rust,ignore
/// let network = Arc::new(MemoryNetwork::new("feed"));
/// let session = FeedSession::new(Arc::new(ContentFeed::subscriptions()), network, cache, config);
/// let outcome = session.load(FeedFilter::Subscriptions, None).await?;
/// ```
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Shards currently known for `app_name`.
    async fn collect_chains(&self, app_name: &str) -> Vec<ChainId>;

    /// Ask the network layer to refresh its shard state.
    fn request_state(&self);

    /// Send `request` to `request.quorum` independent peers of its shard.
    fn scatter(
        &self,
        request: FeedRequest,
        reply: ScatterReply,
    ) -> Result<RequestHandle, TransportError>;

    /// Fetch items by id from one shard in a single batch.
    fn select_content(
        &self,
        chain_id: ChainId,
        ids: Vec<ItemId>,
        reply: ContentReply,
    ) -> Result<(), TransportError>;

    /// Fetch identity records by id from one shard in a single batch.
    fn load_transactions(
        &self,
        chain_id: ChainId,
        ids: Vec<ItemId>,
        reply: IdentityReply,
    ) -> Result<(), TransportError>;
}
