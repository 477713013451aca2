//! Feed items and their ordering keys

use std::fmt;

use serde::{Deserialize, Serialize};

use super::hash::{ChainId, ItemId, PublisherId};

/// Width of a ranking timeframe: five minutes in microseconds.
pub const FEED_TIMEFRAME_MICROS: u64 = 5 * 60 * 1_000_000;

/// Distinguishes items sharing an id, e.g. a post and a like of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Post,
    Reply,
    Repost,
    Message,
    Conversation,
    Like,
    Reward,
    Endorse,
    Mistrust,
    Subscription,
}

impl ItemKind {
    pub fn label(&self) -> &'static str {
        match self {
            ItemKind::Post => "post",
            ItemKind::Reply => "reply",
            ItemKind::Repost => "repost",
            ItemKind::Message => "message",
            ItemKind::Conversation => "conversation",
            ItemKind::Like => "like",
            ItemKind::Reward => "reward",
            ItemKind::Endorse => "endorse",
            ItemKind::Mistrust => "mistrust",
            ItemKind::Subscription => "subscription",
        }
    }

    /// Kinds that nest under their parent in a thread.
    pub fn is_threaded(&self) -> bool {
        matches!(self, ItemKind::Reply | ItemKind::Message)
    }

    /// Kinds a parent reference may resolve to.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            ItemKind::Post
                | ItemKind::Reply
                | ItemKind::Repost
                | ItemKind::Message
                | ItemKind::Conversation
        )
    }

    /// Kinds that act on another content item without nesting under it.
    pub fn acts_on_content(&self) -> bool {
        matches!(self, ItemKind::Repost | ItemKind::Like | ItemKind::Reward)
    }
}

/// Merge key: an item is identified by its id together with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedKey {
    pub id: ItemId,
    pub kind: ItemKind,
}

impl FeedKey {
    pub fn new(id: ItemId, kind: ItemKind) -> Self {
        Self { id, kind }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id.short(), self.kind.label())
    }
}

/// Pointer to an item living on a specific shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemRef {
    pub chain_id: ChainId,
    pub id: ItemId,
}

impl ItemRef {
    pub fn new(chain_id: ChainId, id: ItemId) -> Self {
        Self { chain_id, id }
    }
}

/// How top-level entries are ranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// Strictly by timestamp
    #[default]
    Timestamp,
    /// By five-minute timeframe, then score within the timeframe, then timestamp
    TimeframeScore,
}

/// Position of an item in the ordered index. Larger sorts newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OrderKey {
    pub timeframe: u64,
    pub score: u64,
    pub timestamp: u64,
}

impl OrderKey {
    pub fn of(item: &FeedItem, grouping: Grouping) -> Self {
        // replies always read chronologically
        let grouping = if item.kind.is_threaded() {
            Grouping::Timestamp
        } else {
            grouping
        };

        match grouping {
            Grouping::Timestamp => Self {
                timeframe: 0,
                score: 0,
                timestamp: item.timestamp,
            },
            Grouping::TimeframeScore => Self {
                timeframe: item.timestamp / FEED_TIMEFRAME_MICROS,
                score: item.score,
                timestamp: item.timestamp,
            },
        }
    }
}

/// One entry of a feed as returned by a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub id: ItemId,
    pub kind: ItemKind,
    /// Shard the item lives on
    pub chain_id: ChainId,
    /// Microseconds since the epoch
    pub timestamp: u64,
    #[serde(default)]
    pub score: u64,
    pub publisher_id: PublisherId,
    /// Where the publisher's identity record lives
    #[serde(default)]
    pub publisher_info: Option<ItemRef>,
    #[serde(default)]
    pub parent: Option<ItemRef>,
    #[serde(default)]
    pub root: Option<ItemRef>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl FeedItem {
    pub fn new(
        id: ItemId,
        kind: ItemKind,
        chain_id: ChainId,
        timestamp: u64,
        publisher_id: PublisherId,
    ) -> Self {
        Self {
            id,
            kind,
            chain_id,
            timestamp,
            score: 0,
            publisher_id,
            publisher_info: None,
            parent: None,
            root: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_parent(mut self, parent: ItemRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_root(mut self, root: ItemRef) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_score(mut self, score: u64) -> Self {
        self.score = score;
        self
    }

    pub fn with_publisher_info(mut self, info: ItemRef) -> Self {
        self.publisher_info = Some(info);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.id, self.kind)
    }

    /// Tags carried in the payload (`{"tags": ["rust", ...]}`).
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.payload
            .get("tags")
            .and_then(|t| t.as_array())
            .into_iter()
            .flatten()
            .filter_map(|t| t.as_str())
    }
}
