//! Published feed views and observer events

use std::sync::Arc;

use serde::Serialize;

use crate::identity::PublisherProfile;
use crate::model::{FeedItem, FeedKey, ItemId, ItemRef};

/// Change notifications delivered to feed observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// An item was admitted for the first time
    ItemNew(FeedKey),
    /// An admitted item changed (newer version, new reply, identity attached)
    ItemUpdated(FeedKey),
    /// A threaded item references a parent the container does not hold
    ItemAbsent(ItemRef),
    /// Emitted once after a batch of `ItemNew`/`ItemUpdated`
    LargeUpdate,
}

/// One top-level entry with its replies and resolved publisher.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    pub item: FeedItem,
    pub publisher: Option<PublisherProfile>,
    /// Replies, oldest first
    pub replies: Vec<FeedEntry>,
}

impl FeedEntry {
    /// Total number of entries in this thread, including this one.
    pub fn thread_len(&self) -> usize {
        1 + self.replies.iter().map(FeedEntry::thread_len).sum::<usize>()
    }
}

/// Immutable, restartable view of a feed, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSnapshot {
    entries: Arc<Vec<FeedEntry>>,
}

impl FeedSnapshot {
    pub fn new(entries: Vec<FeedEntry>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FeedEntry> {
        self.entries.get(index)
    }

    /// Top-level item ids in enumeration order.
    pub fn ids(&self) -> Vec<ItemId> {
        self.entries.iter().map(|e| e.item.id).collect()
    }
}

impl<'a> IntoIterator for &'a FeedSnapshot {
    type Item = &'a FeedEntry;
    type IntoIter = std::slice::Iter<'a, FeedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
