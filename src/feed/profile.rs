//! Feed kind capabilities.
//!
//! Every feed kind runs the same reconciliation protocol; what differs is
//! captured by [`FeedProfile`]: which filters it serves, how its shard
//! requests look, how partial responses combine, which references must be
//! backfilled, and which fields make up its cursor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::cursor::{Cursor, CursorFields, PageDirection};
use super::policy::MergePolicy;
use crate::error::{FeedError, Result};
use crate::model::{ChainId, FeedItem, Grouping, Hash256, ItemId, ItemRef, PublisherId};

/// What the caller wants to see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum FeedFilter {
    /// Everything the local account subscribes to
    Subscriptions,
    /// Everything the network ranks
    Global,
    Publisher { publisher_id: PublisherId },
    Thread { chain_id: ChainId, root_id: ItemId },
    Tag { tag: String },
    Conversations { publisher_id: PublisherId },
}

impl FeedFilter {
    pub fn label(&self) -> &'static str {
        match self {
            FeedFilter::Subscriptions => "subscriptions",
            FeedFilter::Global => "global",
            FeedFilter::Publisher { .. } => "publisher",
            FeedFilter::Thread { .. } => "thread",
            FeedFilter::Tag { .. } => "tag",
            FeedFilter::Conversations { .. } => "conversations",
        }
    }

    /// Whether `item` falls under this filter.
    pub fn matches(&self, item: &FeedItem) -> bool {
        match self {
            FeedFilter::Subscriptions | FeedFilter::Global => true,
            FeedFilter::Publisher { publisher_id } | FeedFilter::Conversations { publisher_id } => {
                item.publisher_id == *publisher_id
                    || item
                        .payload
                        .get("counterpart")
                        .and_then(|c| c.as_str())
                        .map(|c| c == publisher_id.to_hex())
                        .unwrap_or(false)
            }
            FeedFilter::Thread { root_id, .. } => {
                item.id == *root_id
                    || item.root.map(|r| r.id) == Some(*root_id)
                    || item.parent.map(|p| p.id) == Some(*root_id)
            }
            FeedFilter::Tag { tag } => item.tags().any(|t| t.eq_ignore_ascii_case(tag)),
        }
    }
}

/// Parse an identifier given either as 64 hex digits or `@label`.
fn parse_id(s: &str) -> Result<Hash256> {
    match s.strip_prefix('@') {
        Some(label) if !label.is_empty() => Ok(Hash256::from_label(label)),
        Some(_) => Err(FeedError::InvalidId(s.to_string())),
        None => s.parse(),
    }
}

impl FromStr for FeedFilter {
    type Err = FeedError;

    /// `subscriptions`, `global`, `publisher:<id>`, `thread:<chain>:<root>`,
    /// `tag:<tag>`, `conversations:<id>`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(2, ':');
        let head = parts.next().unwrap_or_default();
        let rest = parts.next();

        match (head, rest) {
            ("subscriptions", None) => Ok(FeedFilter::Subscriptions),
            ("global", None) => Ok(FeedFilter::Global),
            ("publisher", Some(id)) => Ok(FeedFilter::Publisher {
                publisher_id: parse_id(id)?,
            }),
            ("conversations", Some(id)) => Ok(FeedFilter::Conversations {
                publisher_id: parse_id(id)?,
            }),
            ("tag", Some(tag)) => Ok(FeedFilter::Tag {
                tag: tag.to_string(),
            }),
            ("thread", Some(ids)) => {
                let (chain, root) = ids.split_once(':').ok_or_else(|| {
                    FeedError::InvalidArgument(format!(
                        "thread filter needs <chain>:<root>, got {ids}"
                    ))
                })?;
                Ok(FeedFilter::Thread {
                    chain_id: parse_id(chain)?,
                    root_id: parse_id(root)?,
                })
            }
            _ => Err(FeedError::InvalidArgument(format!("unknown filter: {s}"))),
        }
    }
}

/// Outbound request for one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRequest {
    /// Feed kind name, e.g. `content`
    pub feed: String,
    pub chain_id: ChainId,
    pub filter: FeedFilter,
    pub cursor: Option<Cursor>,
    pub direction: PageDirection,
    /// Independent confirmations the shard must deliver
    pub quorum: usize,
    pub limit: usize,
}

/// Capabilities that distinguish one feed kind from another.
pub trait FeedProfile: Send + Sync + fmt::Debug {
    /// Short name used in requests and logs.
    fn name(&self) -> &'static str;

    /// Reject filters this kind cannot serve, before any network activity.
    fn validate(&self, filter: &FeedFilter) -> Result<FeedFilter>;

    fn merge_policy(&self) -> MergePolicy;

    fn cursor_fields(&self) -> CursorFields;

    fn grouping(&self) -> Grouping {
        Grouping::Timestamp
    }

    /// References that must be present for `item` to display.
    fn extract_pending_refs(&self, item: &FeedItem) -> Vec<ItemRef> {
        let mut refs = Vec::new();
        if item.kind.is_threaded() || item.kind.acts_on_content() {
            refs.extend(item.parent);
        }
        if item.kind.is_threaded() {
            refs.extend(item.root.filter(|r| Some(*r) != item.parent));
        }
        refs
    }

    fn build_request(
        &self,
        chain_id: ChainId,
        filter: &FeedFilter,
        cursor: Option<Cursor>,
        direction: PageDirection,
        quorum: usize,
        limit: usize,
    ) -> FeedRequest {
        FeedRequest {
            feed: self.name().to_string(),
            chain_id,
            filter: filter.clone(),
            cursor: cursor.map(|c| c.project(self.cursor_fields())),
            direction,
            quorum,
            limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filters() {
        assert_eq!("global".parse::<FeedFilter>().unwrap(), FeedFilter::Global);
        assert_eq!(
            "publisher:@alice".parse::<FeedFilter>().unwrap(),
            FeedFilter::Publisher {
                publisher_id: Hash256::from_label("alice")
            }
        );
        let hex = Hash256::from_label("root").to_hex();
        let thread: FeedFilter = format!("thread:@chain-a:{hex}").parse().unwrap();
        assert_eq!(
            thread,
            FeedFilter::Thread {
                chain_id: Hash256::from_label("chain-a"),
                root_id: Hash256::from_label("root"),
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        let err = "publisher:xyz".parse::<FeedFilter>().unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ID");
        let err = "publisher:@".parse::<FeedFilter>().unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ID");
        let err = "bogus".parse::<FeedFilter>().unwrap_err();
        assert_eq!(err.code(), "E_INVALID_ARGUMENT");
    }

    #[test]
    fn test_thread_filter_matches_descendants() {
        let chain = Hash256::from_label("c");
        let root = Hash256::from_label("root");
        let filter = FeedFilter::Thread { chain_id: chain, root_id: root };
        let reply = FeedItem::new(
            Hash256::from_label("r"),
            crate::model::ItemKind::Reply,
            chain,
            1,
            Hash256::from_label("bob"),
        )
        .with_root(ItemRef::new(chain, root));
        assert!(filter.matches(&reply));
    }
}
