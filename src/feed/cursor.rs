//! Per-shard pagination cursors

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::container::FeedContainer;
use crate::error::{FeedError, Result};
use crate::model::{ChainId, FeedItem, Grouping, OrderKey, PublisherId};

/// Which cursor fields a feed kind sends to shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorFields {
    pub timeframe: bool,
    pub score: bool,
    pub timestamp: bool,
    pub publisher: bool,
}

impl CursorFields {
    pub const TIMESTAMP: Self = Self {
        timeframe: false,
        score: false,
        timestamp: true,
        publisher: false,
    };

    pub const PUBLISHER_TIMESTAMP: Self = Self {
        timeframe: false,
        score: false,
        timestamp: true,
        publisher: true,
    };

    pub const RANKED: Self = Self {
        timeframe: true,
        score: true,
        timestamp: true,
        publisher: false,
    };
}

/// Position inside one shard's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub timeframe: u64,
    pub score: u64,
    pub timestamp: u64,
    pub publisher_id: Option<PublisherId>,
}

impl Cursor {
    pub fn from_item(item: &FeedItem, grouping: Grouping) -> Self {
        let order = OrderKey::of(item, grouping);
        Self {
            timeframe: order.timeframe,
            score: order.score,
            timestamp: order.timestamp,
            publisher_id: Some(item.publisher_id),
        }
    }

    /// Keep only the fields `fields` selects.
    pub fn project(self, fields: CursorFields) -> Self {
        Self {
            timeframe: if fields.timeframe { self.timeframe } else { 0 },
            score: if fields.score { self.score } else { 0 },
            timestamp: if fields.timestamp { self.timestamp } else { 0 },
            publisher_id: if fields.publisher { self.publisher_id } else { None },
        }
    }

    /// Ordering key comparable against items of the same shard.
    pub fn order(&self) -> OrderKey {
        OrderKey {
            timeframe: self.timeframe,
            score: self.score,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageDirection {
    /// Strictly older than the cursor
    #[default]
    Older,
    /// Strictly newer than the cursor
    Newer,
}

/// Opaque handle for requesting the next page of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PageToken {
    pub direction: PageDirection,
    pub cursors: BTreeMap<ChainId, Cursor>,
}

impl PageToken {
    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Cursor state for one feed session.
///
/// Cursors are replaced wholesale between pages and are frozen while a page
/// request is in flight.
#[derive(Debug)]
pub struct CursorManager {
    fields: CursorFields,
    grouping: Grouping,
    direction: PageDirection,
    cursors: BTreeMap<ChainId, Cursor>,
    in_flight: bool,
}

impl CursorManager {
    pub fn new(fields: CursorFields, grouping: Grouping) -> Self {
        Self {
            fields,
            grouping,
            direction: PageDirection::Older,
            cursors: BTreeMap::new(),
            in_flight: false,
        }
    }

    /// Build a page token from what `container` already holds.
    pub fn capture(&self, container: &FeedContainer, direction: PageDirection) -> PageToken {
        let cursors = container
            .boundaries(direction == PageDirection::Older)
            .into_iter()
            .map(|(chain, item)| {
                (chain, Cursor::from_item(item, self.grouping).project(self.fields))
            })
            .collect();
        PageToken { direction, cursors }
    }

    /// Replace all cursors with those of `token`.
    pub fn install(&mut self, token: PageToken) -> Result<()> {
        if self.in_flight {
            return Err(FeedError::PageInFlight);
        }
        self.direction = token.direction;
        self.cursors = token
            .cursors
            .into_iter()
            .map(|(chain, cursor)| (chain, cursor.project(self.fields)))
            .collect();
        Ok(())
    }

    /// Forget all cursors (a refresh from the top).
    pub fn reset(&mut self) -> Result<()> {
        if self.in_flight {
            return Err(FeedError::PageInFlight);
        }
        self.cursors.clear();
        self.direction = PageDirection::Older;
        Ok(())
    }

    pub fn cursor_for(&self, chain_id: &ChainId) -> Option<Cursor> {
        self.cursors.get(chain_id).copied()
    }

    pub fn direction(&self) -> PageDirection {
        self.direction
    }

    pub fn is_paging(&self) -> bool {
        !self.cursors.is_empty()
    }

    pub fn freeze(&mut self) {
        self.in_flight = true;
    }

    pub fn release(&mut self) {
        self.in_flight = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.in_flight
    }
}
