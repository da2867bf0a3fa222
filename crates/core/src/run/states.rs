use serde::{Deserialize, Serialize};

use crate::errors::InvariantViolation;

/// Where a rule run currently stands. Mutations only happen in `Applying`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Collecting,
    QuotaAllocated,
    Merged,
    GuardChecked,
    Applying,
    Complete,
    Aborted,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    fn can_advance_to(&self, next: RunPhase) -> bool {
        use RunPhase::{Aborted, Applying, Collecting, Complete, GuardChecked, Merged, QuotaAllocated};

        matches!(
            (self, next),
            (Collecting, QuotaAllocated)
                | (QuotaAllocated, Merged)
                | (Merged, GuardChecked)
                | (Merged, Aborted)
                | (GuardChecked, Applying)
                | (Applying, Complete)
        )
    }
}

/// Records the phases a run went through and refuses to skip or go back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseTracker {
    history: Vec<RunPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self { history: vec![RunPhase::Collecting] }
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RunPhase {
        self.history.last().copied().unwrap_or(RunPhase::Collecting)
    }

    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: RunPhase) -> Result<(), InvariantViolation> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(InvariantViolation::InvalidPhaseTransition { from: current, to: next });
        }
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{PhaseTracker, RunPhase};
    use crate::errors::InvariantViolation;

    #[test]
    fn happy_path_reaches_complete() {
        let mut phases = PhaseTracker::new();
        for next in [
            RunPhase::QuotaAllocated,
            RunPhase::Merged,
            RunPhase::GuardChecked,
            RunPhase::Applying,
            RunPhase::Complete,
        ] {
            phases.advance(next).expect("valid transition");
        }

        assert_eq!(phases.current(), RunPhase::Complete);
        assert!(phases.current().is_terminal());
        assert_eq!(phases.history().len(), 6);
    }

    #[test]
    fn abort_is_only_reachable_from_merged() {
        let mut phases = PhaseTracker::new();
        let error = phases.advance(RunPhase::Aborted).expect_err("collecting cannot abort");
        assert_eq!(
            error,
            InvariantViolation::InvalidPhaseTransition {
                from: RunPhase::Collecting,
                to: RunPhase::Aborted,
            }
        );

        phases.advance(RunPhase::QuotaAllocated).expect("allocate");
        phases.advance(RunPhase::Merged).expect("merge");
        phases.advance(RunPhase::Aborted).expect("abort after merge");
        assert!(phases.advance(RunPhase::Applying).is_err());
    }

    #[test]
    fn applying_cannot_skip_the_guard() {
        let mut phases = PhaseTracker::new();
        phases.advance(RunPhase::QuotaAllocated).expect("allocate");
        phases.advance(RunPhase::Merged).expect("merge");
        assert!(phases.advance(RunPhase::Applying).is_err());
        assert_eq!(phases.current(), RunPhase::Merged);
    }
}
