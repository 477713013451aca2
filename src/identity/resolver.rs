//! Identity trust resolution.
//!
//! Items name their publisher's identity record by id. Before a record is
//! attached to a feed it must be one we asked for, its id must match its
//! content, its signature must verify, and its back-reference must name the
//! publisher the referencing item claims. A failing record is discarded and
//! reported; the round carries on.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use super::cache::IdentityCache;
use super::record::PublisherIdentityRecord;
use crate::feed::FeedContainer;
use crate::model::{ChainId, ItemId, PublisherId};
use crate::reconcile::PendingReferenceSet;

/// Where a pending identity lives and whom it must describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedPublisher {
    pub chain_id: ChainId,
    pub publisher_id: PublisherId,
}

/// Why a record was not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TrustFailure {
    /// Nobody in the feed referenced this record
    Unrequested,
    /// The id is not the digest of the record
    ContentAddress,
    Signature,
    BackReference {
        expected: PublisherId,
        found: PublisherId,
    },
}

impl std::fmt::Display for TrustFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustFailure::Unrequested => f.write_str("record was not requested"),
            TrustFailure::ContentAddress => f.write_str("record id does not match content"),
            TrustFailure::Signature => f.write_str("signature does not verify"),
            TrustFailure::BackReference { expected, found } => write!(
                f,
                "record describes {} but item claims {}",
                found.short(),
                expected.short()
            ),
        }
    }
}

/// Result of one identity batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustOutcome {
    pub admitted: Vec<ItemId>,
    pub rejected: Vec<(ItemId, TrustFailure)>,
}

/// Per-round state of identity resolution.
#[derive(Debug, Default)]
pub struct IdentityTrustResolver {
    expected: BTreeMap<ItemId, ExpectedPublisher>,
    chains: BTreeSet<ChainId>,
    processed: BTreeSet<ChainId>,
}

impl IdentityTrustResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect identities the container still lacks. Cached identities for
    /// the expected publisher are attached immediately; the rest are
    /// returned grouped by shard for fetching.
    pub fn prepare(
        &mut self,
        container: &mut FeedContainer,
        cache: &IdentityCache,
    ) -> PendingReferenceSet {
        self.expected.clear();
        self.chains.clear();
        self.processed.clear();

        let mut pending = PendingReferenceSet::new();
        for (info, publisher_id) in container.unresolved_identities() {
            if let Some(profile) = cache.get(&info.id) {
                if profile.publisher_id == publisher_id {
                    container.attach_identity(profile);
                    continue;
                }
                debug!(
                    info = %info.id.short(),
                    "cached identity names another publisher, refetching"
                );
            }
            self.expected.insert(
                info.id,
                ExpectedPublisher {
                    chain_id: info.chain_id,
                    publisher_id,
                },
            );
            self.chains.insert(info.chain_id);
            pending.insert(info.chain_id, info.id);
        }
        pending
    }

    /// Run the trust checks for one record.
    pub fn verify(
        &self,
        record: &PublisherIdentityRecord,
    ) -> Result<ExpectedPublisher, TrustFailure> {
        let expected = *self
            .expected
            .get(&record.id)
            .ok_or(TrustFailure::Unrequested)?;
        if !record.verify_content_address() {
            return Err(TrustFailure::ContentAddress);
        }
        if !record.verify_signature() {
            return Err(TrustFailure::Signature);
        }
        if *record.back_reference() != expected.publisher_id {
            return Err(TrustFailure::BackReference {
                expected: expected.publisher_id,
                found: *record.back_reference(),
            });
        }
        Ok(expected)
    }

    /// Whether a batch from `chain_id` is still awaited.
    pub fn awaits(&self, chain_id: &ChainId) -> bool {
        self.chains.contains(chain_id) && !self.processed.contains(chain_id)
    }

    /// Process one shard's batch of records.
    pub fn accept_batch(
        &mut self,
        chain_id: ChainId,
        records: Vec<PublisherIdentityRecord>,
        container: &mut FeedContainer,
        cache: &IdentityCache,
    ) -> TrustOutcome {
        self.processed.insert(chain_id);

        let mut outcome = TrustOutcome::default();
        for record in records {
            match self.verify(&record) {
                Ok(_) => {
                    let profile = record.profile();
                    cache.insert(profile.clone());
                    container.attach_identity(profile);
                    self.expected.remove(&record.id);
                    outcome.admitted.push(record.id);
                }
                Err(reason) => {
                    warn!(info = %record.id.short(), %reason, "rejected identity record");
                    outcome.rejected.push((record.id, reason));
                }
            }
        }
        container.announce();
        outcome
    }

    /// A batch timed out or could not be dispatched.
    pub fn batch_failed(&mut self, chain_id: &ChainId) {
        self.processed.insert(*chain_id);
        debug!(chain = %chain_id.short(), "identity batch produced nothing");
    }

    /// Every shard with pending identities has answered.
    pub fn is_complete(&self) -> bool {
        self.chains.is_subset(&self.processed)
    }

    /// Identities still unresolved.
    pub fn unresolved(&self) -> usize {
        self.expected.len()
    }

    /// Shards whose batches have not come back.
    pub fn awaited(&self) -> Vec<ChainId> {
        self.chains.difference(&self.processed).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ContainerConfig, ShardResponse};
    use crate::model::{FeedItem, Hash256, ItemKind, ItemRef};
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn setup(record: &PublisherIdentityRecord, claimed: &str) -> FeedContainer {
        let mut container = FeedContainer::new(ContainerConfig::default());
        let item = FeedItem::new(
            Hash256::from_label("p1"),
            ItemKind::Post,
            Hash256::from_label("a"),
            1,
            Hash256::from_label(claimed),
        )
        .with_publisher_info(ItemRef::new(record.chain_id, record.id));
        container.merge(&ShardResponse::new(Hash256::from_label("a"), "p", vec![item]), true);
        container
    }

    fn record_for(publisher: &str) -> PublisherIdentityRecord {
        PublisherIdentityRecord::sign(
            &SigningKey::generate(&mut OsRng),
            Hash256::from_label("x"),
            Hash256::from_label(publisher),
            publisher,
            publisher.to_uppercase(),
        )
    }

    #[test]
    fn test_valid_record_is_admitted() {
        let record = record_for("alice");
        let mut container = setup(&record, "alice");
        let cache = IdentityCache::with_defaults();
        let mut resolver = IdentityTrustResolver::new();

        let pending = resolver.prepare(&mut container, &cache);
        assert_eq!(pending.len(), 1);
        assert!(!resolver.is_complete());

        let outcome =
            resolver.accept_batch(record.chain_id, vec![record.clone()], &mut container, &cache);
        assert_eq!(outcome.admitted, vec![record.id]);
        assert!(resolver.is_complete());
        assert!(cache.contains(&record.id));
        assert_eq!(container.feed().get(0).unwrap().publisher.as_ref().unwrap().name, "alice");
    }

    #[test]
    fn test_back_reference_mismatch_is_rejected() {
        // validly signed, but describes bob while the item claims alice
        let record = record_for("bob");
        let mut container = setup(&record, "alice");
        let cache = IdentityCache::with_defaults();
        let mut resolver = IdentityTrustResolver::new();
        resolver.prepare(&mut container, &cache);

        let outcome =
            resolver.accept_batch(record.chain_id, vec![record.clone()], &mut container, &cache);
        assert!(outcome.admitted.is_empty());
        assert!(matches!(outcome.rejected[0].1, TrustFailure::BackReference { .. }));
        assert!(cache.is_empty());
        assert!(container.feed().get(0).unwrap().publisher.is_none());
        assert!(resolver.is_complete(), "a rejected batch still counts as processed");
    }

    #[test]
    fn test_bad_signature_is_rejected() {
        let mut record = record_for("alice");
        let mut container = setup(&record, "alice");
        record.signature[0] ^= 0x01;
        let resolver = {
            let mut r = IdentityTrustResolver::new();
            r.prepare(&mut container, &IdentityCache::with_defaults());
            r
        };
        // content address covers the signature, so that check fires first
        assert_eq!(resolver.verify(&record), Err(TrustFailure::ContentAddress));
    }

    #[test]
    fn test_unrequested_record_is_rejected() {
        let record = record_for("alice");
        let resolver = IdentityTrustResolver::new();
        assert_eq!(resolver.verify(&record), Err(TrustFailure::Unrequested));
    }

    #[test]
    fn test_cached_identity_skips_network() {
        let record = record_for("alice");
        let mut container = setup(&record, "alice");
        let cache = IdentityCache::with_defaults();
        cache.insert(record.profile());

        let mut resolver = IdentityTrustResolver::new();
        let pending = resolver.prepare(&mut container, &cache);
        assert!(pending.is_empty());
        assert!(resolver.is_complete());
        assert!(container.unresolved_identities().is_empty());
    }
}
