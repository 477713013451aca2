//! Feed containers, merge policies, cursors and feed kinds

mod container;
mod cursor;
mod kinds;
mod policy;
mod profile;
mod snapshot;

pub use container::{ContainerConfig, FeedContainer, MergeOutcome, ShardResponse};
pub use cursor::{Cursor, CursorFields, CursorManager, PageDirection, PageToken};
pub use kinds::{ContentFeed, ConversationFeed, ReactionFeed, TagFeed};
pub use policy::{ConfirmationTally, MergePolicy};
pub use profile::{FeedFilter, FeedProfile, FeedRequest};
pub use snapshot::{FeedEntry, FeedEvent, FeedSnapshot};
