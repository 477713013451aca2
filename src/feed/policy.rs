//! Merge policies and per-item confirmation tallies

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{FeedItem, FeedKey, PeerId};

/// How partial responses from independent peers combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum MergePolicy {
    /// Any item returned by any peer is admitted
    Union,
    /// An item is admitted once `agreement` distinct peers returned it
    Intersect { agreement: usize },
}

impl MergePolicy {
    pub fn intersect(agreement: usize) -> Self {
        MergePolicy::Intersect {
            agreement: agreement.max(1),
        }
    }

    /// Distinct confirmations an item needs before it is admitted.
    pub fn agreement(&self) -> usize {
        match self {
            MergePolicy::Union => 1,
            MergePolicy::Intersect { agreement } => (*agreement).max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    item: FeedItem,
    peers: BTreeSet<PeerId>,
}

/// Items seen this round that have not reached agreement yet.
#[derive(Debug, Default)]
pub struct ConfirmationTally {
    candidates: HashMap<FeedKey, Candidate>,
}

impl ConfirmationTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `peer` returned `item`; returns the distinct confirmations
    /// so far. The most recently confirmed version is the one kept.
    pub fn confirm(&mut self, item: &FeedItem, peer: &str) -> usize {
        let candidate = self
            .candidates
            .entry(item.key())
            .or_insert_with(|| Candidate {
                item: item.clone(),
                peers: BTreeSet::new(),
            });
        candidate.item = item.clone();
        candidate.peers.insert(peer.to_string());
        candidate.peers.len()
    }

    pub fn confirmations(&self, key: &FeedKey) -> usize {
        self.candidates.get(key).map(|c| c.peers.len()).unwrap_or(0)
    }

    /// Remove a candidate that reached agreement.
    pub fn take(&mut self, key: &FeedKey) -> Option<FeedItem> {
        self.candidates.remove(key).map(|c| c.item)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Hash256, ItemKind};

    fn item(label: &str, ts: u64) -> FeedItem {
        FeedItem::new(
            Hash256::from_label(label),
            ItemKind::Post,
            Hash256::from_label("chain"),
            ts,
            Hash256::from_label("pub"),
        )
    }

    #[test]
    fn test_distinct_peers_counted_once() {
        let mut tally = ConfirmationTally::new();
        assert_eq!(tally.confirm(&item("a", 1), "p1"), 1);
        assert_eq!(tally.confirm(&item("a", 1), "p1"), 1, "repeat from same peer");
        assert_eq!(tally.confirm(&item("a", 1), "p2"), 2);
        assert_eq!(tally.confirmations(&item("a", 1).key()), 2);
    }

    #[test]
    fn test_latest_version_kept() {
        let mut tally = ConfirmationTally::new();
        tally.confirm(&item("a", 1).with_score(1), "p1");
        tally.confirm(&item("a", 1).with_score(9), "p2");
        let taken = tally.take(&item("a", 1).key()).unwrap();
        assert_eq!(taken.score, 9);
        assert!(tally.is_empty());
    }

    #[test]
    fn test_agreement_floor() {
        assert_eq!(MergePolicy::Union.agreement(), 1);
        assert_eq!(MergePolicy::intersect(0).agreement(), 1);
        assert_eq!(MergePolicy::intersect(3).agreement(), 3);
    }
}
