//! Publisher identities: signed records, trust checks, shared cache

mod cache;
mod record;
mod resolver;

pub use cache::{CacheStatsSnapshot, IdentityCache, IdentityCacheConfig};
pub use record::{PublisherIdentityRecord, PublisherProfile};
pub use resolver::{ExpectedPublisher, IdentityTrustResolver, TrustFailure, TrustOutcome};
