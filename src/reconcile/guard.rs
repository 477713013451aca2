//! Single-flight guard and session phases

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where a feed session is in its reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    FanningOut,
    Gathering,
    Merged,
    Backfilling {
        round: usize,
    },
    ResolvingIdentities,
    Published,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Idle => f.write_str("idle"),
            SessionPhase::FanningOut => f.write_str("fanning-out"),
            SessionPhase::Gathering => f.write_str("gathering"),
            SessionPhase::Merged => f.write_str("merged"),
            SessionPhase::Backfilling { round } => write!(f, "backfilling({round})"),
            SessionPhase::ResolvingIdentities => f.write_str("resolving-identities"),
            SessionPhase::Published => f.write_str("published"),
        }
    }
}

/// At most one reconciliation cycle per session.
#[derive(Debug, Default)]
pub struct SingleFlight {
    processing: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the session. Returns `None` while another cycle runs.
    pub fn try_begin(self: &Arc<Self>) -> Option<FlightPermit> {
        self.processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightPermit {
                flight: Arc::clone(self),
            })
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }
}

/// Held for the duration of one cycle; releases the session on drop.
#[derive(Debug)]
pub struct FlightPermit {
    flight: Arc<SingleFlight>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        self.flight.processing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_begin_is_refused() {
        let flight = SingleFlight::new();
        let permit = flight.try_begin();
        assert!(permit.is_some());
        assert!(flight.try_begin().is_none());
        assert!(flight.is_processing());

        drop(permit);
        assert!(!flight.is_processing());
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SessionPhase::Backfilling { round: 2 }.to_string(), "backfilling(2)");
        assert_eq!(SessionPhase::default(), SessionPhase::Idle);
    }
}
