//! Core data model: identifiers, items, ordering keys

mod hash;
mod item;

pub use hash::{ChainId, Hash256, ItemId, PublisherId};
pub use item::{
    FeedItem, FeedKey, Grouping, ItemKind, ItemRef, OrderKey, FEED_TIMEFRAME_MICROS,
};

/// Name of a responding peer; confirmations are counted per distinct peer.
pub type PeerId = String;
