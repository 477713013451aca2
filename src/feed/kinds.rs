//! Concrete feed kinds

use super::cursor::CursorFields;
use super::policy::MergePolicy;
use super::profile::{FeedFilter, FeedProfile};
use crate::error::{FeedError, Result};
use crate::model::{FeedItem, Grouping, ItemRef};

fn unsupported(feed: &str, filter: &FeedFilter) -> FeedError {
    FeedError::InvalidArgument(format!("{feed} feed cannot serve a {} filter", filter.label()))
}

/// Posts, replies and reposts, ranked by timeframe and score.
///
/// Feeds the local account assembled itself (its subscriptions, a single
/// publisher, one thread) union peer responses. The global feed is
/// assembled by strangers and requires agreement.
#[derive(Debug, Clone)]
pub struct ContentFeed {
    policy: MergePolicy,
}

impl ContentFeed {
    pub fn subscriptions() -> Self {
        Self {
            policy: MergePolicy::Union,
        }
    }

    pub fn global(agreement: usize) -> Self {
        Self {
            policy: MergePolicy::intersect(agreement),
        }
    }
}

impl FeedProfile for ContentFeed {
    fn name(&self) -> &'static str {
        "content"
    }

    fn validate(&self, filter: &FeedFilter) -> Result<FeedFilter> {
        match filter {
            FeedFilter::Subscriptions
            | FeedFilter::Global
            | FeedFilter::Publisher { .. }
            | FeedFilter::Thread { .. } => Ok(filter.clone()),
            other => Err(unsupported(self.name(), other)),
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        self.policy
    }

    fn cursor_fields(&self) -> CursorFields {
        CursorFields::RANKED
    }

    fn grouping(&self) -> Grouping {
        Grouping::TimeframeScore
    }
}

/// Likes, rewards, endorsements and subscriptions concerning a publisher.
#[derive(Debug, Clone, Default)]
pub struct ReactionFeed;

impl FeedProfile for ReactionFeed {
    fn name(&self) -> &'static str {
        "reactions"
    }

    fn validate(&self, filter: &FeedFilter) -> Result<FeedFilter> {
        match filter {
            FeedFilter::Publisher { .. } | FeedFilter::Subscriptions => Ok(filter.clone()),
            other => Err(unsupported(self.name(), other)),
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::Union
    }

    fn cursor_fields(&self) -> CursorFields {
        CursorFields::PUBLISHER_TIMESTAMP
    }

    /// Every reaction needs the content it reacts to.
    fn extract_pending_refs(&self, item: &FeedItem) -> Vec<ItemRef> {
        item.parent.into_iter().collect()
    }
}

/// Conversation heads and their messages.
#[derive(Debug, Clone)]
pub struct ConversationFeed {
    agreement: usize,
}

impl ConversationFeed {
    pub fn new(agreement: usize) -> Self {
        Self { agreement }
    }
}

impl FeedProfile for ConversationFeed {
    fn name(&self) -> &'static str {
        "conversations"
    }

    fn validate(&self, filter: &FeedFilter) -> Result<FeedFilter> {
        match filter {
            FeedFilter::Conversations { .. } => Ok(filter.clone()),
            other => Err(unsupported(self.name(), other)),
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::intersect(self.agreement)
    }

    fn cursor_fields(&self) -> CursorFields {
        CursorFields::TIMESTAMP
    }
}

/// Content carrying a hashtag.
#[derive(Debug, Clone)]
pub struct TagFeed {
    agreement: usize,
}

impl TagFeed {
    pub fn new(agreement: usize) -> Self {
        Self { agreement }
    }

    /// Strip a leading `#` and lower-case; empty or spaced tags are rejected.
    pub fn normalize(tag: &str) -> Result<String> {
        let tag = tag.trim().trim_start_matches('#');
        if tag.is_empty() || tag.chars().any(char::is_whitespace) {
            return Err(FeedError::InvalidArgument(format!("invalid tag {tag:?}")));
        }
        Ok(tag.to_lowercase())
    }
}

impl FeedProfile for TagFeed {
    fn name(&self) -> &'static str {
        "tags"
    }

    fn validate(&self, filter: &FeedFilter) -> Result<FeedFilter> {
        match filter {
            FeedFilter::Tag { tag } => Ok(FeedFilter::Tag {
                tag: Self::normalize(tag)?,
            }),
            other => Err(unsupported(self.name(), other)),
        }
    }

    fn merge_policy(&self) -> MergePolicy {
        MergePolicy::intersect(self.agreement)
    }

    fn cursor_fields(&self) -> CursorFields {
        CursorFields::RANKED
    }

    fn grouping(&self) -> Grouping {
        Grouping::TimeframeScore
    }
}
