//! Wall-clock budgets for a pipeline invocation and its phases.

use std::time::Duration;
use tokio::time::Instant;

/// Total budget, measured from the start of the current invocation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    started: Instant,
    total: Duration,
}

/// Time allotted to one phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseAllowance {
    pub deadline: Instant,
    /// The total budget, not the phase budget, sets the deadline.
    pub limited_by_total: bool,
}

impl Budget {
    pub fn start(total: Duration) -> Self {
        Self {
            started: Instant::now(),
            total,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.total.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Deadline for a phase allowed `phase_timeout`, capped by what is left
    /// of the total budget.
    pub fn allowance(&self, phase_timeout: Duration) -> PhaseAllowance {
        let remaining = self.remaining();
        let limited_by_total = remaining < phase_timeout;
        PhaseAllowance {
            deadline: Instant::now() + remaining.min(phase_timeout),
            limited_by_total,
        }
    }
}

impl PhaseAllowance {
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_allowance_capped_by_total() {
        let budget = Budget::start(Duration::from_secs(10));
        let allowance = budget.allowance(Duration::from_secs(60));
        assert!(allowance.limited_by_total);
        assert!(allowance.remaining() <= Duration::from_secs(10));

        let allowance = budget.allowance(Duration::from_secs(5));
        assert!(!allowance.limited_by_total);
        assert!(allowance.remaining() <= Duration::from_secs(5));
    }

    #[test]
    fn test_zero_budget_is_expired() {
        let budget = Budget::start(Duration::ZERO);
        assert!(budget.expired());
        assert!(budget.allowance(Duration::from_secs(1)).expired());
    }
}
