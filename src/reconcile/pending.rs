//! Pending references and the bounded backfill loop

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::model::{ChainId, ItemId};

/// Referenced-but-absent item ids, grouped by the shard that holds them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PendingReferenceSet {
    by_chain: BTreeMap<ChainId, BTreeSet<ItemId>>,
}

impl PendingReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chain_id: ChainId, id: ItemId) -> bool {
        self.by_chain.entry(chain_id).or_default().insert(id)
    }

    pub fn contains(&self, chain_id: &ChainId, id: &ItemId) -> bool {
        self.by_chain
            .get(chain_id)
            .map(|ids| ids.contains(id))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.by_chain.is_empty()
    }

    /// Number of pending ids across all shards.
    pub fn len(&self) -> usize {
        self.by_chain.values().map(BTreeSet::len).sum()
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainId> {
        self.by_chain.keys()
    }

    pub fn ids_for(&self, chain_id: &ChainId) -> Option<&BTreeSet<ItemId>> {
        self.by_chain.get(chain_id)
    }

    /// One request batch per shard.
    pub fn into_batches(self) -> Vec<(ChainId, Vec<ItemId>)> {
        self.by_chain
            .into_iter()
            .map(|(chain, ids)| (chain, ids.into_iter().collect()))
            .collect()
    }
}

/// What the backfill loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillDecision {
    /// Nothing is pending
    Complete,
    /// The round ceiling was hit with references still unresolved
    Exhausted(PendingReferenceSet),
    /// Issue one batched fetch per shard
    Dispatch(Vec<(ChainId, Vec<ItemId>)>),
}

/// Round counter and outstanding-batch bookkeeping for backfill.
#[derive(Debug)]
pub struct BackfillTracker {
    max_rounds: usize,
    round: usize,
    outstanding: BTreeSet<ChainId>,
}

impl BackfillTracker {
    pub fn new(max_rounds: usize) -> Self {
        Self {
            max_rounds,
            round: 0,
            outstanding: BTreeSet::new(),
        }
    }

    /// Decide the next round given what is still pending.
    pub fn next_round(&mut self, pending: PendingReferenceSet) -> BackfillDecision {
        if pending.is_empty() {
            return BackfillDecision::Complete;
        }
        if self.round >= self.max_rounds {
            return BackfillDecision::Exhausted(pending);
        }

        self.round += 1;
        let batches = pending.into_batches();
        self.outstanding = batches.iter().map(|(chain, _)| *chain).collect();
        BackfillDecision::Dispatch(batches)
    }

    /// A batch for `chain_id` came back, timed out, or failed to dispatch.
    /// Returns true once every batch of the round has settled.
    pub fn settle(&mut self, chain_id: &ChainId) -> bool {
        self.outstanding.remove(chain_id);
        self.outstanding.is_empty()
    }

    pub fn is_outstanding(&self, chain_id: &ChainId) -> bool {
        self.outstanding.contains(chain_id)
    }

    /// Chains whose batches have not settled.
    pub fn outstanding(&self) -> Vec<ChainId> {
        self.outstanding.iter().copied().collect()
    }

    /// Rounds dispatched so far.
    pub fn rounds(&self) -> usize {
        self.round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Hash256;

    fn pending(entries: &[(&str, &str)]) -> PendingReferenceSet {
        let mut set = PendingReferenceSet::new();
        for (chain, id) in entries {
            set.insert(Hash256::from_label(chain), Hash256::from_label(id));
        }
        set
    }

    #[test]
    fn test_batches_group_by_chain() {
        let set = pending(&[("a", "x"), ("a", "y"), ("b", "z")]);
        assert_eq!(set.len(), 3);

        let batches = set.into_batches();
        assert_eq!(batches.len(), 2, "one batch per shard");
        let total: usize = batches.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_empty_pending_completes_without_round() {
        let mut tracker = BackfillTracker::new(3);
        assert_eq!(tracker.next_round(PendingReferenceSet::new()), BackfillDecision::Complete);
        assert_eq!(tracker.rounds(), 0);
    }

    #[test]
    fn test_round_settles_after_all_batches() {
        let mut tracker = BackfillTracker::new(3);
        let decision = tracker.next_round(pending(&[("a", "x"), ("b", "y")]));
        assert!(matches!(decision, BackfillDecision::Dispatch(ref b) if b.len() == 2));

        assert!(!tracker.settle(&Hash256::from_label("a")));
        assert!(tracker.settle(&Hash256::from_label("b")));
    }

    #[test]
    fn test_ceiling_reports_remaining() {
        let mut tracker = BackfillTracker::new(1);
        tracker.next_round(pending(&[("a", "x")]));
        tracker.settle(&Hash256::from_label("a"));

        match tracker.next_round(pending(&[("a", "x")])) {
            BackfillDecision::Exhausted(rest) => assert_eq!(rest.len(), 1),
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(tracker.rounds(), 1);
    }
}
