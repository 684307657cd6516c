//! Deterministic trajectory ordering.

use std::cmp::Ordering;
use crate::trajectory::Trajectory;

/// Order two trajectories best-first.
///
/// Higher CMP wins; ties go to the higher benchmark score, then the lower
/// resource usage, then the earlier `created_at`, then the id. Unscored
/// values sort after scored ones.
pub fn compare(a: &Trajectory, b: &Trajectory) -> Ordering {
    desc_opt(a.cmp_score, b.cmp_score)
        .then_with(|| desc_opt(a.benchmark_score, b.benchmark_score))
        .then_with(|| usage_key(a).cmp(&usage_key(b)))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort best-first in place.
pub fn sort_best_first(trajectories: &mut [Trajectory]) {
    trajectories.sort_by(compare);
}

/// The best trajectory of a slice, if any.
pub fn best<'a, I>(trajectories: I) -> Option<&'a Trajectory>
where
    I: IntoIterator<Item = &'a Trajectory>,
{
    trajectories.into_iter().min_by(|a, b| compare(a, b))
}

fn desc_opt(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn usage_key(t: &Trajectory) -> (u64, u128) {
    t.sandbox_result
        .as_ref()
        .map(|r| r.resource_usage.cost_key())
        .unwrap_or((u64::MAX, u128::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ResourceUsage, SandboxResult, SandboxStatus};
    use crate::id::RunId;
    use crate::trajectory::{CodeArtifact, OperatorKind};
    use std::time::Duration;

    fn scored(cmp: Option<f64>, bench: Option<f64>, mem: Option<u64>) -> Trajectory {
        let mut t = Trajectory::propose(
            RunId::new(),
            "agent",
            0,
            OperatorKind::Seed,
            vec![],
            CodeArtifact::new(""),
            "",
        );
        t.cmp_score = cmp;
        t.benchmark_score = bench;
        t.sandbox_result = Some(SandboxResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            execution_time: Duration::ZERO,
            resource_usage: ResourceUsage {
                peak_memory_bytes: mem,
                cpu_time: None,
            },
            status: SandboxStatus::Completed,
        });
        t
    }

    #[test]
    fn test_higher_cmp_first() {
        let a = scored(Some(0.5), None, None);
        let b = scored(Some(0.9), None, None);
        assert_eq!(compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_tie_broken_by_benchmark_then_resources() {
        let a = scored(Some(0.8), Some(0.5), Some(10));
        let b = scored(Some(0.8), Some(0.7), Some(99));
        assert_eq!(compare(&b, &a), Ordering::Less);

        let c = scored(Some(0.8), Some(0.7), Some(10));
        assert_eq!(compare(&c, &b), Ordering::Less);
    }

    #[test]
    fn test_tie_broken_by_creation_time() {
        let mut a = scored(Some(0.8), Some(0.7), Some(10));
        let mut b = a.clone();
        b.id = crate::id::TrajectoryId::new();
        a.created_at = chrono::Utc::now() - chrono::Duration::seconds(5);
        b.created_at = chrono::Utc::now();
        let mut all = vec![b.clone(), a.clone()];
        sort_best_first(&mut all);
        assert_eq!(all[0].id, a.id);
    }

    #[test]
    fn test_unscored_last() {
        let a = scored(None, None, None);
        let b = scored(Some(0.1), None, None);
        assert_eq!(best([&a, &b]).map(|t| t.id), Some(b.id));
    }
}
