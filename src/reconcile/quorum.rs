//! Per-shard quorum accounting for a scatter-gather round

use std::collections::BTreeMap;

use crate::error::{FeedError, Result};
use crate::model::ChainId;

/// Arrival bookkeeping for one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardQuorumState {
    pub arrivals: usize,
    pub quorum: usize,
    pub done: bool,
    pub timed_out: bool,
}

impl ShardQuorumState {
    pub fn new(quorum: usize) -> Self {
        Self {
            arrivals: 0,
            quorum,
            done: false,
            timed_out: false,
        }
    }

    /// Reached quorum or gave up.
    pub fn is_settled(&self) -> bool {
        self.done || self.timed_out
    }
}

/// Result of recording one arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    pub arrivals: usize,
    /// This arrival completed the shard's quorum
    pub shard_done: bool,
    /// Every shard has now settled
    pub ready: bool,
}

#[derive(Debug, Clone)]
pub struct QuorumTracker {
    quorum: usize,
    shards: BTreeMap<ChainId, ShardQuorumState>,
}

impl QuorumTracker {
    pub fn begin(shards: &[ChainId], quorum: usize) -> Result<Self> {
        if shards.is_empty() {
            return Err(FeedError::NoShards("round".into()));
        }
        if quorum == 0 {
            return Err(FeedError::InvalidArgument("quorum must be at least 1".into()));
        }
        Ok(Self {
            quorum,
            shards: shards
                .iter()
                .map(|chain| (*chain, ShardQuorumState::new(quorum)))
                .collect(),
        })
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn state(&self, chain_id: &ChainId) -> Option<&ShardQuorumState> {
        self.shards.get(chain_id)
    }

    /// Count a response for `chain_id`. Returns `None` for shards that are
    /// not part of the round or have already timed out.
    pub fn record_arrival(&mut self, chain_id: &ChainId) -> Option<Arrival> {
        let state = self.shards.get_mut(chain_id)?;
        if state.timed_out {
            return None;
        }
        state.arrivals += 1;
        let shard_done = !state.done && state.arrivals >= state.quorum;
        if shard_done {
            state.done = true;
        }
        let arrivals = state.arrivals;
        Some(Arrival {
            arrivals,
            shard_done,
            ready: self.is_ready(),
        })
    }

    /// Give up on a shard that never reached quorum. Returns false if the
    /// shard had already settled.
    pub fn mark_timed_out(&mut self, chain_id: &ChainId) -> bool {
        match self.shards.get_mut(chain_id) {
            Some(state) if !state.is_settled() => {
                state.timed_out = true;
                true
            }
            _ => false,
        }
    }

    /// Arrivals that count toward quorum, capped per shard.
    pub fn effective_arrivals(&self) -> usize {
        self.shards
            .values()
            .map(|s| s.arrivals.min(s.quorum))
            .sum()
    }

    /// Every shard reached quorum.
    pub fn is_quorate(&self) -> bool {
        self.effective_arrivals() >= self.quorum * self.shards.len()
    }

    /// Every shard settled, by quorum or timeout.
    pub fn is_ready(&self) -> bool {
        self.shards.values().all(ShardQuorumState::is_settled)
    }

    pub fn unsettled(&self) -> Vec<ChainId> {
        self.shards
            .iter()
            .filter(|(_, s)| !s.is_settled())
            .map(|(chain, _)| *chain)
            .collect()
    }

    pub fn confirmed(&self) -> Vec<ChainId> {
        self.shards
            .iter()
            .filter(|(_, s)| s.done)
            .map(|(chain, _)| *chain)
            .collect()
    }

    pub fn timed_out(&self) -> Vec<ChainId> {
        self.shards
            .iter()
            .filter(|(_, s)| s.timed_out)
            .map(|(chain, _)| *chain)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Hash256;

    fn chains(n: usize) -> Vec<ChainId> {
        (0..n).map(|i| Hash256::from_label(&format!("chain-{i}"))).collect()
    }

    #[test]
    fn test_empty_shard_set_is_rejected() {
        let err = QuorumTracker::begin(&[], 3).unwrap_err();
        assert_eq!(err.code(), "E_CHAINS_ABSENT");
    }

    #[test]
    fn test_ready_exactly_at_quorum_times_shards() {
        for n in 1..=4 {
            for q in 1..=4 {
                let shards = chains(n);
                let mut tracker = QuorumTracker::begin(&shards, q).unwrap();
                let mut delivered = 0;
                // round-robin so every shard progresses evenly
                'outer: for _ in 0..q {
                    for chain in &shards {
                        let arrival = tracker.record_arrival(chain).unwrap();
                        delivered += 1;
                        if arrival.ready {
                            break 'outer;
                        }
                    }
                }
                assert_eq!(delivered, q * n, "n={n} q={q}");
                assert!(tracker.is_quorate());
            }
        }
    }

    #[test]
    fn test_surplus_arrivals_do_not_complete_other_shards() {
        let shards = chains(2);
        let mut tracker = QuorumTracker::begin(&shards, 2).unwrap();
        for _ in 0..5 {
            tracker.record_arrival(&shards[0]);
        }
        assert!(!tracker.is_ready());
        assert!(!tracker.is_quorate());
        assert_eq!(tracker.effective_arrivals(), 2);
    }

    #[test]
    fn test_timeout_settles_shard() {
        let shards = chains(2);
        let mut tracker = QuorumTracker::begin(&shards, 1).unwrap();
        tracker.record_arrival(&shards[0]);
        assert!(tracker.mark_timed_out(&shards[1]));
        assert!(tracker.is_ready());
        assert!(!tracker.is_quorate());
        assert_eq!(tracker.timed_out(), vec![shards[1]]);
        assert!(tracker.record_arrival(&shards[1]).is_none(), "late arrival ignored");
        assert!(!tracker.mark_timed_out(&shards[0]), "done shard cannot time out");
    }
}
