//! Quorum scatter-gather, backfill, identity resolution and the session
//! that drives them.

mod engine;
mod guard;
mod pending;
mod quorum;
mod session;

pub use engine::{
    Command, ReconcileWarning, Reconciliation, RoundContext, RoundSummary, SessionEvent, Stage,
    Step,
};
pub use guard::{FlightPermit, SessionPhase, SingleFlight};
pub use pending::{BackfillDecision, BackfillTracker, PendingReferenceSet};
pub use quorum::{Arrival, QuorumTracker, ShardQuorumState};
pub use session::{FeedReport, FeedSession, LoadOutcome};
