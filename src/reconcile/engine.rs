//! Reconciliation step machine.
//!
//! One round of a feed load as a synchronous state machine: the session
//! feeds it [`SessionEvent`]s and executes the [`Command`]s it returns.
//! No I/O happens here, so every transition can be driven directly in tests.
//!
//! ```text
//! FANNING_OUT -> GATHERING -> MERGED -> BACKFILLING* -> RESOLVING_IDENTITIES -> PUBLISHED
//! ```

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::guard::SessionPhase;
use super::pending::{BackfillDecision, BackfillTracker, PendingReferenceSet};
use super::quorum::QuorumTracker;
use crate::config::ReconcileConfig;
use crate::error::{FeedError, Result};
use crate::feed::{
    CursorManager, FeedContainer, FeedFilter, FeedProfile, FeedRequest, ShardResponse,
};
use crate::identity::{IdentityCache, IdentityTrustResolver, PublisherIdentityRecord, TrustFailure};
use crate::model::{ChainId, FeedItem, ItemId};

// =============================================================================
// Messages
// =============================================================================

/// Outbound work the session must hand to the request processor.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Scatter(FeedRequest),
    SelectContent {
        chain_id: ChainId,
        ids: Vec<ItemId>,
        round: usize,
    },
    LoadIdentities {
        chain_id: ChainId,
        ids: Vec<ItemId>,
    },
}

/// Which kind of request a failure or timeout belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scatter,
    Backfill,
    Identity,
}

/// Inbound messages: shard replies, timeouts, dispatch failures.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Partial(ShardResponse),
    ShardTimeout {
        chain_id: ChainId,
    },
    ContentLoaded {
        chain_id: ChainId,
        round: usize,
        items: Vec<FeedItem>,
    },
    ContentTimeout {
        chain_id: ChainId,
        round: usize,
    },
    IdentitiesLoaded {
        chain_id: ChainId,
        records: Vec<PublisherIdentityRecord>,
    },
    IdentityTimeout {
        chain_id: ChainId,
    },
    DispatchFailed {
        chain_id: ChainId,
        stage: Stage,
        round: usize,
        reason: String,
    },
    /// The current phase ran out of time
    Deadline,
}

/// Recoverable faults reported alongside a published feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum ReconcileWarning {
    QuorumTimeout {
        chain_id: ChainId,
        arrivals: usize,
        quorum: usize,
        purged: usize,
    },
    DispatchFailed {
        chain_id: ChainId,
        stage: Stage,
        reason: String,
    },
    BackfillTimeout {
        chain_id: ChainId,
        round: usize,
    },
    BackfillExhausted {
        remaining: usize,
        rounds: usize,
    },
    IdentityTimeout {
        chain_id: ChainId,
    },
    TrustRejected {
        info_id: ItemId,
        failure: TrustFailure,
    },
}

impl ReconcileWarning {
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileWarning::QuorumTimeout { .. } => "W_QUORUM_TIMEOUT",
            ReconcileWarning::DispatchFailed { .. } => "W_DISPATCH_FAILED",
            ReconcileWarning::BackfillTimeout { .. } => "W_BACKFILL_TIMEOUT",
            ReconcileWarning::BackfillExhausted { .. } => "W_BACKFILL_EXHAUSTED",
            ReconcileWarning::IdentityTimeout { .. } => "W_IDENTITY_TIMEOUT",
            ReconcileWarning::TrustRejected { .. } => "W_TRUST_REJECTED",
        }
    }
}

/// How a round ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoundSummary {
    /// Arrivals counted toward quorum
    pub arrivals: usize,
    /// Every shard reached quorum
    pub quorate: bool,
    pub timed_out: Vec<ChainId>,
    pub backfill_rounds: usize,
    pub unresolved_refs: PendingReferenceSet,
    pub unresolved_identities: usize,
    pub warnings: Vec<ReconcileWarning>,
}

/// What the session should do after an event.
#[derive(Debug)]
pub enum Step {
    Continue(Vec<Command>),
    Published(RoundSummary),
    Failed(FeedError),
}

impl Step {
    fn idle() -> Self {
        Step::Continue(Vec::new())
    }
}

/// Mutable state a step may touch.
pub struct RoundContext<'a> {
    pub container: &'a mut FeedContainer,
    pub identities: &'a IdentityCache,
}

// =============================================================================
// Reconciliation
// =============================================================================

pub struct Reconciliation {
    profile: Arc<dyn FeedProfile>,
    phase: SessionPhase,
    quorum: QuorumTracker,
    backfill: BackfillTracker,
    identities: IdentityTrustResolver,
    unresolved_refs: PendingReferenceSet,
    warnings: Vec<ReconcileWarning>,
}

impl Reconciliation {
    /// Begin a round: one scatter request per shard.
    pub fn start(
        profile: Arc<dyn FeedProfile>,
        filter: &FeedFilter,
        shards: &[ChainId],
        cursors: &CursorManager,
        config: &ReconcileConfig,
    ) -> Result<(Self, Vec<Command>)> {
        let quorum = QuorumTracker::begin(shards, config.quorum)?;

        let commands = shards
            .iter()
            .map(|chain_id| {
                Command::Scatter(profile.build_request(
                    *chain_id,
                    filter,
                    cursors.cursor_for(chain_id),
                    cursors.direction(),
                    config.quorum,
                    config.page_size,
                ))
            })
            .collect();

        debug!(feed = profile.name(), shards = shards.len(), quorum = config.quorum, "fanning out");

        Ok((
            Self {
                profile,
                phase: SessionPhase::Gathering,
                quorum,
                backfill: BackfillTracker::new(config.max_backfill_rounds),
                identities: IdentityTrustResolver::new(),
                unresolved_refs: PendingReferenceSet::new(),
                warnings: Vec::new(),
            },
            commands,
        ))
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn quorum(&self) -> &QuorumTracker {
        &self.quorum
    }

    pub fn warnings(&self) -> &[ReconcileWarning] {
        &self.warnings
    }

    /// Advance the round by one event.
    pub fn handle(&mut self, event: SessionEvent, ctx: &mut RoundContext<'_>) -> Step {
        match (self.phase, event) {
            (SessionPhase::Gathering, SessionEvent::Partial(response)) => {
                self.on_partial(response, ctx)
            }
            (SessionPhase::Gathering, SessionEvent::ShardTimeout { chain_id }) => {
                self.on_shard_timeout(chain_id, ctx)
            }
            (
                SessionPhase::Gathering,
                SessionEvent::DispatchFailed {
                    chain_id,
                    stage: Stage::Scatter,
                    reason,
                    ..
                },
            ) => {
                self.dispatch_failed(chain_id, Stage::Scatter, reason);
                self.on_shard_timeout(chain_id, ctx)
            }
            (SessionPhase::Gathering, SessionEvent::Deadline) => {
                let mut step = Step::idle();
                for chain_id in self.quorum.unsettled() {
                    step = self.on_shard_timeout(chain_id, ctx);
                }
                step
            }

            (
                SessionPhase::Backfilling { .. },
                SessionEvent::ContentLoaded {
                    chain_id,
                    round,
                    items,
                },
            ) => self.on_backfill(chain_id, round, items, ctx),
            (
                SessionPhase::Backfilling { .. },
                SessionEvent::ContentTimeout { chain_id, round },
            ) => {
                if self.backfill.is_outstanding(&chain_id) && round == self.backfill.rounds() {
                    self.backfill_timed_out(chain_id, round);
                }
                self.on_backfill(chain_id, round, Vec::new(), ctx)
            }
            (
                SessionPhase::Backfilling { .. },
                SessionEvent::DispatchFailed {
                    chain_id,
                    stage: Stage::Backfill,
                    round,
                    reason,
                },
            ) => {
                self.dispatch_failed(chain_id, Stage::Backfill, reason);
                self.on_backfill(chain_id, round, Vec::new(), ctx)
            }
            (SessionPhase::Backfilling { round }, SessionEvent::Deadline) => {
                let mut step = Step::idle();
                for chain_id in self.backfill.outstanding() {
                    self.backfill_timed_out(chain_id, round);
                    step = self.on_backfill(chain_id, round, Vec::new(), ctx);
                }
                step
            }

            (
                SessionPhase::ResolvingIdentities,
                SessionEvent::IdentitiesLoaded { chain_id, records },
            ) => self.on_identities(chain_id, Some(records), ctx),
            (SessionPhase::ResolvingIdentities, SessionEvent::IdentityTimeout { chain_id }) => {
                if self.identities.awaits(&chain_id) {
                    warn!(chain = %chain_id.short(), "identity batch timed out");
                    self.warnings.push(ReconcileWarning::IdentityTimeout { chain_id });
                }
                self.on_identities(chain_id, None, ctx)
            }
            (
                SessionPhase::ResolvingIdentities,
                SessionEvent::DispatchFailed {
                    chain_id,
                    stage: Stage::Identity,
                    reason,
                    ..
                },
            ) => {
                self.dispatch_failed(chain_id, Stage::Identity, reason);
                self.on_identities(chain_id, None, ctx)
            }
            (SessionPhase::ResolvingIdentities, SessionEvent::Deadline) => {
                let mut step = Step::idle();
                for chain_id in self.identities.awaited() {
                    self.warnings.push(ReconcileWarning::IdentityTimeout { chain_id });
                    step = self.on_identities(chain_id, None, ctx);
                }
                step
            }

            (phase, event) => {
                debug!(%phase, ?event, "ignoring event outside its phase");
                Step::idle()
            }
        }
    }

    // -------------------------------------------------------------------------
    // Gathering
    // -------------------------------------------------------------------------

    fn on_partial(&mut self, response: ShardResponse, ctx: &mut RoundContext<'_>) -> Step {
        let Some(arrival) = self.quorum.record_arrival(&response.chain_id) else {
            debug!(
                chain = %response.chain_id.short(),
                "ignoring response from settled or unknown shard"
            );
            return Step::idle();
        };

        debug!(
            chain = %response.chain_id.short(),
            peer = %response.peer,
            arrivals = arrival.arrivals,
            items = response.items.len(),
            "shard response"
        );

        ctx.container.merge(&response, arrival.ready);
        if arrival.ready {
            self.after_gather(ctx)
        } else {
            Step::idle()
        }
    }

    fn on_shard_timeout(&mut self, chain_id: ChainId, ctx: &mut RoundContext<'_>) -> Step {
        if !self.quorum.mark_timed_out(&chain_id) {
            return Step::idle();
        }

        let arrivals = self.quorum.state(&chain_id).map(|s| s.arrivals).unwrap_or(0);
        let purged = ctx.container.purge_round(&chain_id);
        warn!(
            chain = %chain_id.short(),
            arrivals,
            quorum = self.quorum.quorum(),
            purged,
            "shard timed out before quorum"
        );
        self.warnings.push(ReconcileWarning::QuorumTimeout {
            chain_id,
            arrivals,
            quorum: self.quorum.quorum(),
            purged,
        });

        if !self.quorum.is_ready() {
            return Step::idle();
        }
        if self.quorum.confirmed().is_empty() {
            return Step::Failed(FeedError::AllShardsTimedOut(self.quorum.shard_count()));
        }
        ctx.container.announce();
        self.after_gather(ctx)
    }

    fn after_gather(&mut self, ctx: &mut RoundContext<'_>) -> Step {
        self.phase = SessionPhase::Merged;
        info!(
            feed = self.profile.name(),
            arrivals = self.quorum.effective_arrivals(),
            shards = self.quorum.shard_count(),
            quorate = self.quorum.is_quorate(),
            items = ctx.container.len(),
            "gather complete"
        );
        ctx.container.cross_merge(true);
        self.next_backfill(ctx)
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    fn next_backfill(&mut self, ctx: &mut RoundContext<'_>) -> Step {
        let profile = Arc::clone(&self.profile);
        let pending = ctx
            .container
            .collect_pending_items(|item| profile.extract_pending_refs(item));

        match self.backfill.next_round(pending) {
            BackfillDecision::Complete => self.resolve_identities(ctx),
            BackfillDecision::Exhausted(remaining) => {
                warn!(
                    remaining = remaining.len(),
                    rounds = self.backfill.rounds(),
                    "backfill ceiling reached"
                );
                self.warnings.push(ReconcileWarning::BackfillExhausted {
                    remaining: remaining.len(),
                    rounds: self.backfill.rounds(),
                });
                self.unresolved_refs = remaining;
                self.resolve_identities(ctx)
            }
            BackfillDecision::Dispatch(batches) => {
                let round = self.backfill.rounds();
                self.phase = SessionPhase::Backfilling { round };
                debug!(round, batches = batches.len(), "backfilling pending references");
                Step::Continue(
                    batches
                        .into_iter()
                        .map(|(chain_id, ids)| Command::SelectContent { chain_id, ids, round })
                        .collect(),
                )
            }
        }
    }

    fn on_backfill(
        &mut self,
        chain_id: ChainId,
        round: usize,
        items: Vec<FeedItem>,
        ctx: &mut RoundContext<'_>,
    ) -> Step {
        if round != self.backfill.rounds() || !self.backfill.is_outstanding(&chain_id) {
            debug!(chain = %chain_id.short(), round, "ignoring stale backfill batch");
            return Step::idle();
        }

        let last = self.backfill.settle(&chain_id);
        ctx.container.merge_items(items, last);
        if !last {
            return Step::idle();
        }
        ctx.container.cross_merge(true);
        self.next_backfill(ctx)
    }

    fn backfill_timed_out(&mut self, chain_id: ChainId, round: usize) {
        warn!(chain = %chain_id.short(), round, "backfill batch timed out");
        self.warnings
            .push(ReconcileWarning::BackfillTimeout { chain_id, round });
    }

    // -------------------------------------------------------------------------
    // Identities
    // -------------------------------------------------------------------------

    fn resolve_identities(&mut self, ctx: &mut RoundContext<'_>) -> Step {
        let pending = self.identities.prepare(ctx.container, ctx.identities);
        if pending.is_empty() {
            return self.publish(ctx);
        }

        self.phase = SessionPhase::ResolvingIdentities;
        debug!(identities = pending.len(), "resolving publisher identities");
        Step::Continue(
            pending
                .into_batches()
                .into_iter()
                .map(|(chain_id, ids)| Command::LoadIdentities { chain_id, ids })
                .collect(),
        )
    }

    fn on_identities(
        &mut self,
        chain_id: ChainId,
        records: Option<Vec<PublisherIdentityRecord>>,
        ctx: &mut RoundContext<'_>,
    ) -> Step {
        if !self.identities.awaits(&chain_id) {
            debug!(chain = %chain_id.short(), "ignoring unexpected identity batch");
            return Step::idle();
        }

        match records {
            Some(records) => {
                let outcome = self
                    .identities
                    .accept_batch(chain_id, records, ctx.container, ctx.identities);
                self.warnings.extend(outcome.rejected.into_iter().map(|(info_id, failure)| {
                    ReconcileWarning::TrustRejected { info_id, failure }
                }));
            }
            None => self.identities.batch_failed(&chain_id),
        }

        if self.identities.is_complete() {
            self.publish(ctx)
        } else {
            Step::idle()
        }
    }

    // -------------------------------------------------------------------------
    // Completion
    // -------------------------------------------------------------------------

    fn dispatch_failed(&mut self, chain_id: ChainId, stage: Stage, reason: String) {
        warn!(chain = %chain_id.short(), ?stage, %reason, "request dispatch failed");
        self.warnings.push(ReconcileWarning::DispatchFailed {
            chain_id,
            stage,
            reason,
        });
    }

    fn publish(&mut self, ctx: &mut RoundContext<'_>) -> Step {
        self.phase = SessionPhase::Published;
        ctx.container.announce();

        let summary = RoundSummary {
            arrivals: self.quorum.effective_arrivals(),
            quorate: self.quorum.is_quorate(),
            timed_out: self.quorum.timed_out(),
            backfill_rounds: self.backfill.rounds(),
            unresolved_refs: std::mem::take(&mut self.unresolved_refs),
            unresolved_identities: self.identities.unresolved(),
            warnings: std::mem::take(&mut self.warnings),
        };
        info!(
            feed = self.profile.name(),
            items = ctx.container.len(),
            backfill_rounds = summary.backfill_rounds,
            warnings = summary.warnings.len(),
            "round published"
        );
        Step::Published(summary)
    }
}
