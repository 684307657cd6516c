//! Run budget: wall clock and cost units.

use evoloop_core::BudgetPolicy;
use std::time::Duration;
use tokio::time::Instant;

/// Budget for one evolution run.
#[derive(Debug, Clone, Copy, Default)]
pub struct Budget {
    /// Wall-clock cap for the whole run
    pub max_wall_clock: Option<Duration>,
    /// Cost-unit cap
    pub max_cost_units: Option<f64>,
    /// Units charged per synthesis call
    pub synthesis_cost: f64,
    /// Units charged per second of sandbox time
    pub sandbox_cost_per_sec: f64,
}

impl Budget {
    /// Unlimited budget with no charges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the wall-clock cap.
    pub fn with_wall_clock(mut self, limit: Duration) -> Self {
        self.max_wall_clock = Some(limit);
        self
    }

    /// Set the cost cap.
    pub fn with_cost_limit(mut self, units: f64) -> Self {
        self.max_cost_units = Some(units);
        self
    }

    /// Set per-call and per-second charges.
    pub fn with_rates(mut self, synthesis_cost: f64, sandbox_cost_per_sec: f64) -> Self {
        self.synthesis_cost = synthesis_cost;
        self.sandbox_cost_per_sec = sandbox_cost_per_sec;
        self
    }
}

impl From<&BudgetPolicy> for Budget {
    fn from(p: &BudgetPolicy) -> Self {
        Self {
            max_wall_clock: p.max_wall_clock,
            max_cost_units: p.max_cost_units,
            synthesis_cost: p.synthesis_cost,
            sandbox_cost_per_sec: p.sandbox_cost_per_sec,
        }
    }
}

/// Why the budget ran out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Exhaustion {
    /// Wall-clock cap reached
    WallClock,
    /// Cost cap reached
    Cost {
        /// Units spent
        spent: f64,
    },
}

impl std::fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exhaustion::WallClock => f.write_str("wall-clock budget exhausted"),
            Exhaustion::Cost { spent } => write!(f, "cost budget exhausted ({:.2} units)", spent),
        }
    }
}

/// Tracks spending against a [`Budget`].
#[derive(Debug)]
pub struct BudgetTracker {
    budget: Budget,
    started: Instant,
    spent: f64,
}

impl BudgetTracker {
    /// Start the clock.
    pub fn start(budget: Budget) -> Self {
        Self {
            budget,
            started: Instant::now(),
            spent: 0.0,
        }
    }

    /// Instant the wall-clock cap is reached, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.budget.max_wall_clock.map(|d| self.started + d)
    }

    /// Charge one synthesis call.
    pub fn charge_synthesis(&mut self) {
        self.spent += self.budget.synthesis_cost;
    }

    /// Charge sandbox time.
    pub fn charge_sandbox(&mut self, elapsed: Duration) {
        self.spent += self.budget.sandbox_cost_per_sec * elapsed.as_secs_f64();
    }

    /// Units spent so far.
    pub fn spent(&self) -> f64 {
        self.spent
    }

    /// Time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The exhausted limit, if any.
    pub fn exhausted(&self) -> Option<Exhaustion> {
        if let Some(limit) = self.budget.max_wall_clock {
            if self.started.elapsed() >= limit {
                return Some(Exhaustion::WallClock);
            }
        }
        if let Some(limit) = self.budget.max_cost_units {
            if self.spent >= limit {
                return Some(Exhaustion::Cost { spent: self.spent });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_exhaustion() {
        let mut t = BudgetTracker::start(Budget::new().with_cost_limit(2.5).with_rates(1.0, 0.5));
        t.charge_synthesis();
        assert!(t.exhausted().is_none());
        t.charge_sandbox(Duration::from_secs(3));
        assert!(matches!(t.exhausted(), Some(Exhaustion::Cost { .. })));
        assert_eq!(t.spent(), 2.5);
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let mut t = BudgetTracker::start(Budget::new().with_rates(100.0, 100.0));
        t.charge_synthesis();
        assert!(t.exhausted().is_none());
        assert!(t.deadline().is_none());
    }

    #[tokio::test]
    async fn test_wall_clock_exhaustion() {
        let t = BudgetTracker::start(Budget::new().with_wall_clock(Duration::from_millis(20)));
        assert!(t.deadline().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(t.exhausted(), Some(Exhaustion::WallClock));
    }
}
