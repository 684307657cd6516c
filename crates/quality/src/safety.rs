//! Safety layer: the final gate before promotion.
//!
//! Independent of the judge. A high CMP score never bypasses review, and
//! any failure while evaluating rules fails closed.

use async_trait::async_trait;
use evoloop_core::{
    BenchmarkResult, JudgeScore, RiskLevel, SafetyDecision, SafetyPolicy, SafetyReport,
    SafetyReportId, SandboxStatus, Trajectory, TrajectoryId,
};
use tracing::{info, warn};
use crate::patterns::RiskPatterns;

/// Proof that a safety review approved a trajectory.
///
/// Only obtainable from an approving report whose review saw a CMP at or
/// above its release threshold with non-critical risk. Writing a checkpoint
/// requires one.
#[derive(Debug, Clone, PartialEq)]
pub struct PromotionApproval {
    trajectory_id: TrajectoryId,
    report_id: SafetyReportId,
    cmp: f64,
}

impl PromotionApproval {
    /// Issue an approval for `report`, if it qualifies.
    pub fn issue(report: &SafetyReport) -> Option<Self> {
        let cmp = report.cmp_seen?;
        let qualifies = report.decision == SafetyDecision::Approve
            && report.risk_level != RiskLevel::Critical
            && cmp.is_finite()
            && cmp >= report.release_threshold;
        qualifies.then_some(Self {
            trajectory_id: report.trajectory_id,
            report_id: report.id,
            cmp,
        })
    }

    /// Approved trajectory.
    pub fn trajectory_id(&self) -> TrajectoryId {
        self.trajectory_id
    }

    /// Report that granted the approval.
    pub fn report_id(&self) -> SafetyReportId {
        self.report_id
    }

    /// CMP the review saw.
    pub fn cmp(&self) -> f64 {
        self.cmp
    }
}

/// Result of one review.
#[derive(Debug, Clone)]
pub struct SafetyOutcome {
    /// The report, always produced
    pub report: SafetyReport,
    /// Present only when the report approves
    pub approval: Option<PromotionApproval>,
}

impl SafetyOutcome {
    /// Wrap `report`, issuing an approval when it qualifies.
    pub fn from_report(report: SafetyReport) -> Self {
        let approval = PromotionApproval::issue(&report);
        Self { report, approval }
    }
}

/// Reviews candidates proposed for promotion.
#[async_trait]
pub trait SafetyLayer: Send + Sync {
    /// Review `candidate` given its scores. `baseline_cmp` is the CMP of the
    /// code being replaced, when known.
    async fn review(
        &self,
        candidate: &Trajectory,
        judge_score: &JudgeScore,
        benchmark: Option<&BenchmarkResult>,
        baseline_cmp: Option<f64>,
    ) -> SafetyOutcome;
}

/// Apply the decision policy to an assessed risk and score.
///
/// Critical is always rejected and anything under the release threshold is
/// rejected. High risk is never auto-approved. Medium risk inside the
/// borderline band is held for a human.
pub fn decide(risk: RiskLevel, cmp: f64, policy: &SafetyPolicy) -> SafetyDecision {
    if risk == RiskLevel::Critical {
        return SafetyDecision::Reject;
    }
    if !cmp.is_finite() || cmp < policy.min_release_cmp {
        return SafetyDecision::Reject;
    }
    let borderline = cmp < policy.min_release_cmp + policy.borderline_margin;
    match risk {
        RiskLevel::High => SafetyDecision::HoldForReview,
        RiskLevel::Medium if borderline => SafetyDecision::HoldForReview,
        _ => SafetyDecision::Approve,
    }
}

/// Rule-based safety layer.
pub struct RuleBasedSafetyLayer {
    policy: SafetyPolicy,
    patterns: Option<Result<RiskPatterns, String>>,
}

impl RuleBasedSafetyLayer {
    /// Create a layer. `static_scan` enables the code pattern scan.
    pub fn new(policy: SafetyPolicy, static_scan: bool) -> Self {
        let patterns = static_scan.then(|| RiskPatterns::builtin().map_err(|e| e.to_string()));
        Self { policy, patterns }
    }

    /// Policy in force.
    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    fn assess(
        &self,
        candidate: &Trajectory,
        judge_score: &JudgeScore,
        benchmark: Option<&BenchmarkResult>,
        baseline_cmp: Option<f64>,
    ) -> (RiskLevel, Vec<String>, bool) {
        let mut risk = RiskLevel::Low;
        let mut reasons = Vec::new();
        let mut internal_error = false;
        let mut raise = |level: RiskLevel, reason: String, risk: &mut RiskLevel| {
            *risk = (*risk).max(level);
            reasons.push(reason);
        };

        match &self.patterns {
            Some(Ok(patterns)) => {
                for hit in patterns.scan(candidate.code_artifact.as_str()) {
                    raise(hit.level, format!("{}: {} (line {})", hit.level, hit.rule, hit.line), &mut risk);
                }
            }
            Some(Err(e)) => {
                internal_error = true;
                raise(RiskLevel::High, format!("static scan unavailable: {}", e), &mut risk);
            }
            None => {}
        }

        match &candidate.sandbox_result {
            Some(run) if run.status == SandboxStatus::Completed => {}
            Some(run) => raise(
                RiskLevel::High,
                format!("sandbox run did not complete ({:?})", run.status).to_lowercase(),
                &mut risk,
            ),
            None => raise(RiskLevel::High, "no sandbox evidence".to_string(), &mut risk),
        }

        if let Some(bench) = benchmark {
            if !bench.is_reproducible() {
                raise(
                    RiskLevel::Medium,
                    format!("non-reproducible benchmark tasks: {}", bench.non_reproducible.join(", ")),
                    &mut risk,
                );
            }
        }

        if let Some(baseline) = baseline_cmp {
            if judge_score.cmp < baseline - self.policy.max_regression {
                raise(
                    RiskLevel::High,
                    format!("regression: cmp {:.3} below baseline {:.3}", judge_score.cmp, baseline),
                    &mut risk,
                );
            }
        }

        if !judge_score.cmp.is_finite() {
            internal_error = true;
            raise(RiskLevel::High, "judge produced a non-finite cmp".to_string(), &mut risk);
        }

        (risk, reasons, internal_error)
    }
}

#[async_trait]
impl SafetyLayer for RuleBasedSafetyLayer {
    async fn review(
        &self,
        candidate: &Trajectory,
        judge_score: &JudgeScore,
        benchmark: Option<&BenchmarkResult>,
        baseline_cmp: Option<f64>,
    ) -> SafetyOutcome {
        let (risk, mut reasons, internal_error) = self.assess(candidate, judge_score, benchmark, baseline_cmp);

        let mut decision = decide(risk, judge_score.cmp, &self.policy);
        if internal_error && decision == SafetyDecision::Approve {
            decision = SafetyDecision::HoldForReview;
        }
        if judge_score.cmp < self.policy.min_release_cmp {
            reasons.push(format!(
                "cmp {:.3} below release threshold {:.3}",
                judge_score.cmp, self.policy.min_release_cmp
            ));
        }

        let report = SafetyReport {
            id: SafetyReportId::new(),
            trajectory_id: candidate.id,
            risk_level: risk,
            decision,
            reasons,
            cmp_seen: Some(judge_score.cmp),
            release_threshold: self.policy.min_release_cmp,
            created_at: chrono::Utc::now(),
        };

        match decision {
            SafetyDecision::Approve => info!(trajectory = %candidate.id, cmp = judge_score.cmp, %risk, "Safety review approved"),
            _ => warn!(trajectory = %candidate.id, cmp = judge_score.cmp, %risk, %decision, reasons = ?report.reasons, "Safety review did not approve"),
        }
        SafetyOutcome::from_report(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evoloop_core::{
        Aggregation, CodeArtifact, OperatorKind, ResourceUsage, RunId, SandboxResult,
    };
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn candidate(code: &str, status: SandboxStatus) -> Trajectory {
        let mut t = Trajectory::propose(RunId::new(), "agent", 1, OperatorKind::Seed, vec![], CodeArtifact::new(code), "seed");
        t.sandbox_result = Some(SandboxResult {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            execution_time: Duration::from_millis(10),
            resource_usage: ResourceUsage::default(),
            status,
        });
        t
    }

    fn score(cmp: f64) -> JudgeScore {
        JudgeScore {
            dimensions: BTreeMap::new(),
            cmp,
            aggregation: Aggregation::WeightedMean,
        }
    }

    fn layer() -> RuleBasedSafetyLayer {
        RuleBasedSafetyLayer::new(SafetyPolicy::default(), true)
    }

    #[test]
    fn test_decision_policy() {
        let p = SafetyPolicy::default();
        assert_eq!(decide(RiskLevel::Critical, 0.99, &p), SafetyDecision::Reject);
        assert_eq!(decide(RiskLevel::Low, 0.69, &p), SafetyDecision::Reject);
        assert_eq!(decide(RiskLevel::Low, 0.72, &p), SafetyDecision::Approve);
        assert_eq!(decide(RiskLevel::Medium, 0.75, &p), SafetyDecision::HoldForReview);
        assert_eq!(decide(RiskLevel::Medium, 0.85, &p), SafetyDecision::Approve);
        assert_eq!(decide(RiskLevel::High, 0.95, &p), SafetyDecision::HoldForReview);
        assert_eq!(decide(RiskLevel::Low, f64::NAN, &p), SafetyDecision::Reject);
    }

    #[tokio::test]
    async fn test_critical_rejected_regardless_of_score() {
        let t = candidate("import os\nos.system('rm -rf /')\n", SandboxStatus::Completed);
        let outcome = layer().review(&t, &score(0.95), None, None).await;
        assert_eq!(outcome.report.risk_level, RiskLevel::Critical);
        assert_eq!(outcome.report.decision, SafetyDecision::Reject);
        assert!(outcome.approval.is_none());
    }

    #[tokio::test]
    async fn test_clean_candidate_approved_with_token() {
        let t = candidate("print('hello')\n", SandboxStatus::Completed);
        let outcome = layer().review(&t, &score(0.9), None, None).await;
        assert_eq!(outcome.report.decision, SafetyDecision::Approve);
        let approval = outcome.approval.unwrap();
        assert_eq!(approval.trajectory_id(), t.id);
        assert_eq!(approval.report_id(), outcome.report.id);
        assert_eq!(outcome.report.cmp_seen, Some(0.9));
    }

    #[tokio::test]
    async fn test_regression_and_nonreproducible_block_approval() {
        let t = candidate("print('hello')\n", SandboxStatus::Completed);
        let outcome = layer().review(&t, &score(0.8), None, Some(0.95)).await;
        assert_eq!(outcome.report.decision, SafetyDecision::HoldForReview);
        assert!(outcome.report.reasons.iter().any(|r| r.starts_with("regression")));

        let bench = BenchmarkResult {
            suite_id: "s".into(),
            suite_version: 1,
            task_scores: BTreeMap::new(),
            total_score: 1.0,
            non_reproducible: vec!["flaky".into()],
        };
        let outcome = layer().review(&t, &score(0.75), Some(&bench), None).await;
        assert_eq!(outcome.report.risk_level, RiskLevel::Medium);
        assert_eq!(outcome.report.decision, SafetyDecision::HoldForReview);
    }

    #[tokio::test]
    async fn test_failed_sandbox_never_approved() {
        let t = candidate("print('hello')\n", SandboxStatus::Failed);
        let outcome = layer().review(&t, &score(0.99), None, None).await;
        assert_ne!(outcome.report.decision, SafetyDecision::Approve);
    }

    #[test]
    fn test_approval_requires_qualifying_report() {
        let report = SafetyReport {
            id: SafetyReportId::new(),
            trajectory_id: TrajectoryId::new(),
            risk_level: RiskLevel::Low,
            decision: SafetyDecision::Approve,
            reasons: vec![],
            cmp_seen: Some(0.6),
            release_threshold: 0.7,
            created_at: chrono::Utc::now(),
        };
        assert!(PromotionApproval::issue(&report).is_none());

        let ok = SafetyReport { cmp_seen: Some(0.7), ..report.clone() };
        assert!(PromotionApproval::issue(&ok).is_some());

        let held = SafetyReport { decision: SafetyDecision::HoldForReview, ..ok };
        assert!(PromotionApproval::issue(&held).is_none());
    }
}
