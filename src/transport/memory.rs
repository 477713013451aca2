//! In-process simulated shard network.
//!
//! Each shard holds an honest item store, identity records and a list of
//! peers. Peers answer scatter requests after a configurable latency and can
//! be made to lie: omit items, inject fabricated ones, answer from a script,
//! or stay silent so the shard never reaches quorum.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::{ContentReply, IdentityReply, RequestHandle, RequestProcessor, ScatterReply};
use crate::error::TransportError;
use crate::feed::{FeedRequest, PageDirection};
use crate::identity::PublisherIdentityRecord;
use crate::model::{ChainId, FeedItem, Grouping, ItemId, OrderKey};

#[derive(Debug, Clone, PartialEq)]
pub enum PeerBehavior {
    Honest,
    /// Leaves these items out of its answers
    Omit(BTreeSet<ItemId>),
    /// Adds fabricated items to its answers
    Inject(Vec<FeedItem>),
    /// Answers with exactly these items whatever was asked
    Scripted(Vec<FeedItem>),
    /// Never answers
    Silent,
}

#[derive(Debug, Clone)]
pub struct MemoryShard {
    pub chain_id: ChainId,
    pub items: Vec<FeedItem>,
    pub identities: Vec<PublisherIdentityRecord>,
    pub peers: Vec<PeerBehavior>,
    /// Added to the network latency for this shard's answers
    pub latency: Duration,
}

impl MemoryShard {
    /// A shard with three honest peers.
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            items: Vec::new(),
            identities: Vec::new(),
            peers: vec![PeerBehavior::Honest; 3],
            latency: Duration::ZERO,
        }
    }

    pub fn with_items(mut self, items: impl IntoIterator<Item = FeedItem>) -> Self {
        self.items.extend(items);
        self
    }

    pub fn with_identity(mut self, record: PublisherIdentityRecord) -> Self {
        self.identities.push(record);
        self
    }

    pub fn with_peers(mut self, peers: Vec<PeerBehavior>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The honest answer to `request`, newest first.
    fn page(&self, request: &FeedRequest) -> Vec<FeedItem> {
        let cursor = request.cursor.map(|c| {
            let grouping = if c.timeframe != 0 || c.score != 0 {
                Grouping::TimeframeScore
            } else {
                Grouping::Timestamp
            };
            (c.order(), grouping)
        });

        let mut page: Vec<FeedItem> = self
            .items
            .iter()
            .filter(|item| request.filter.matches(item))
            .filter(|item| match cursor {
                None => true,
                Some((bound, grouping)) => {
                    let order = OrderKey::of(item, grouping);
                    match request.direction {
                        PageDirection::Older => order < bound,
                        PageDirection::Newer => order > bound,
                    }
                }
            })
            .cloned()
            .collect();
        page.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.key().cmp(&b.key())));
        page.truncate(request.limit);
        page
    }

    fn answer(&self, behavior: &PeerBehavior, request: &FeedRequest) -> Option<Vec<FeedItem>> {
        match behavior {
            PeerBehavior::Honest => Some(self.page(request)),
            PeerBehavior::Omit(ids) => Some(
                self.page(request)
                    .into_iter()
                    .filter(|i| !ids.contains(&i.id))
                    .collect(),
            ),
            PeerBehavior::Inject(extra) => {
                let mut items = self.page(request);
                items.extend(extra.iter().cloned());
                Some(items)
            }
            PeerBehavior::Scripted(items) => Some(items.clone()),
            PeerBehavior::Silent => None,
        }
    }
}

/// A whole simulated network implementing [`RequestProcessor`].
#[derive(Debug)]
pub struct MemoryNetwork {
    app_name: String,
    shards: DashMap<ChainId, MemoryShard>,
    latency: Duration,
    timeout: Duration,
    next_handle: AtomicU64,
    state_requests: AtomicUsize,
    requests: DashMap<u64, FeedRequest>,
}

impl MemoryNetwork {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            shards: DashMap::new(),
            latency: Duration::from_millis(2),
            timeout: Duration::from_millis(200),
            next_handle: AtomicU64::new(1),
            state_requests: AtomicUsize::new(0),
            requests: DashMap::new(),
        }
    }

    /// Base delay between successive peer answers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// How long a shard short of answering peers takes to report a timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn add_shard(&self, shard: MemoryShard) {
        self.shards.insert(shard.chain_id, shard);
    }

    pub fn remove_shard(&self, chain_id: &ChainId) -> Option<MemoryShard> {
        self.shards.remove(chain_id).map(|(_, shard)| shard)
    }

    /// Times the reconciler asked for a shard-state refresh.
    pub fn state_requests(&self) -> usize {
        self.state_requests.load(Ordering::Relaxed)
    }

    /// Scatter requests received, in dispatch order.
    pub fn scatter_requests(&self) -> Vec<FeedRequest> {
        let mut requests: Vec<(u64, FeedRequest)> = self
            .requests
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        requests.sort_by_key(|(handle, _)| *handle);
        requests.into_iter().map(|(_, r)| r).collect()
    }

    fn shard(&self, chain_id: &ChainId) -> Result<MemoryShard, TransportError> {
        self.shards
            .get(chain_id)
            .map(|s| s.value().clone())
            .ok_or(TransportError::UnknownChain(*chain_id))
    }
}

#[async_trait]
impl RequestProcessor for MemoryNetwork {
    async fn collect_chains(&self, app_name: &str) -> Vec<ChainId> {
        if app_name != self.app_name {
            return Vec::new();
        }
        let mut chains: Vec<ChainId> = self.shards.iter().map(|s| *s.key()).collect();
        chains.sort();
        chains
    }

    fn request_state(&self) {
        self.state_requests.fetch_add(1, Ordering::Relaxed);
        debug!("shard state refresh requested");
    }

    fn scatter(
        &self,
        request: FeedRequest,
        reply: ScatterReply,
    ) -> Result<RequestHandle, TransportError> {
        let shard = self.shard(&request.chain_id)?;
        if shard.peers.is_empty() {
            return Err(TransportError::Unavailable(request.chain_id));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.requests.insert(handle, request.clone());

        let step = self.latency + shard.latency;
        let answers: Vec<(usize, Vec<FeedItem>)> = shard
            .peers
            .iter()
            .enumerate()
            .filter_map(|(index, behavior)| {
                shard.answer(behavior, &request).map(|items| (index, items))
            })
            .take(request.quorum)
            .collect();

        trace!(chain = %request.chain_id.short(), answering = answers.len(), "scatter");
        let short = answers.len() < request.quorum;

        for (position, (index, items)) in answers.into_iter().enumerate() {
            let reply = reply.clone();
            let peer = format!("{}/peer-{}", request.chain_id.short(), index);
            let delay = step * (position as u32 + 1);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                reply.partial(peer, items);
            });
        }

        if short {
            let timeout = self.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                reply.timeout();
            });
        }

        Ok(RequestHandle(handle))
    }

    fn select_content(
        &self,
        chain_id: ChainId,
        ids: Vec<ItemId>,
        reply: ContentReply,
    ) -> Result<(), TransportError> {
        let shard = self.shard(&chain_id)?;
        let wanted: BTreeSet<ItemId> = ids.into_iter().collect();
        let found: Vec<FeedItem> = shard
            .items
            .iter()
            .filter(|i| wanted.contains(&i.id))
            .cloned()
            .collect();

        let delay = self.latency + shard.latency;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reply.loaded(found);
        });
        Ok(())
    }

    fn load_transactions(
        &self,
        chain_id: ChainId,
        ids: Vec<ItemId>,
        reply: IdentityReply,
    ) -> Result<(), TransportError> {
        let shard = self.shard(&chain_id)?;
        let wanted: BTreeSet<ItemId> = ids.into_iter().collect();
        let found: Vec<PublisherIdentityRecord> = shard
            .identities
            .iter()
            .filter(|r| wanted.contains(&r.id))
            .cloned()
            .collect();

        let delay = self.latency + shard.latency;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            reply.loaded(found);
        });
        Ok(())
    }
}
