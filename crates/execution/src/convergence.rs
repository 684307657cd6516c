//! Plateau detection.

/// Detects when the best score stops improving.
///
/// After each iteration the run's best CMP so far is observed. The run has
/// plateaued once the best has not risen by more than `epsilon` across the
/// last `window` iterations.
#[derive(Debug, Clone)]
pub struct PlateauDetector {
    epsilon: f64,
    window: usize,
    best_so_far: Vec<f64>,
}

impl PlateauDetector {
    /// Create a detector.
    pub fn new(epsilon: f64, window: u32) -> Self {
        Self {
            epsilon,
            window: window.max(1) as usize,
            best_so_far: Vec::new(),
        }
    }

    /// Record one iteration's best CMP (`None` if nothing has scored yet).
    /// Returns whether the run has plateaued.
    pub fn observe(&mut self, best_cmp: Option<f64>) -> bool {
        let previous = self.best_so_far.last().copied().unwrap_or(0.0);
        let current = best_cmp.map_or(previous, |c| c.max(previous));
        self.best_so_far.push(current);
        self.plateaued()
    }

    /// Whether the last `window` iterations improved by at most `epsilon`.
    pub fn plateaued(&self) -> bool {
        let n = self.best_so_far.len();
        if n <= self.window {
            return false;
        }
        self.best_so_far[n - 1] - self.best_so_far[n - 1 - self.window] <= self.epsilon
    }

    /// Best-so-far after each observed iteration.
    pub fn history(&self) -> &[f64] {
        &self.best_so_far
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_scores_plateau_after_window() {
        let mut d = PlateauDetector::new(0.01, 2);
        assert!(!d.observe(Some(0.5)));
        assert!(!d.observe(Some(0.505)));
        assert!(d.observe(Some(0.5)));
    }

    #[test]
    fn test_steady_improvement_does_not_plateau() {
        let mut d = PlateauDetector::new(0.01, 2);
        for cmp in [0.3, 0.4, 0.5, 0.6, 0.7] {
            assert!(!d.observe(Some(cmp)));
        }
        assert_eq!(d.history().len(), 5);
    }

    #[test]
    fn test_worse_iteration_keeps_best() {
        let mut d = PlateauDetector::new(0.0, 1);
        d.observe(Some(0.8));
        assert!(d.observe(Some(0.2)));
        assert_eq!(d.history(), &[0.8, 0.8]);
        assert!(d.observe(None));
    }
}
