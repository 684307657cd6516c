//! Safety review records.

use serde::{Deserialize, Serialize};
use crate::id::{SafetyReportId, TrajectoryId};
use crate::Time;

/// Assessed risk of promoting a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Nothing concerning found
    Low,
    /// Minor concerns
    Medium,
    /// Serious concerns; never auto-approved
    High,
    /// Always rejected
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        })
    }
}

/// Outcome of a safety review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyDecision {
    /// May be promoted
    Approve,
    /// Must not be promoted
    Reject,
    /// Escalated to a human
    HoldForReview,
}

impl std::fmt::Display for SafetyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SafetyDecision::Approve => "approve",
            SafetyDecision::Reject => "reject",
            SafetyDecision::HoldForReview => "hold_for_review",
        })
    }
}

/// One safety review of one trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    /// Unique identifier
    pub id: SafetyReportId,
    /// Reviewed trajectory
    pub trajectory_id: TrajectoryId,
    /// Assessed risk
    pub risk_level: RiskLevel,
    /// Decision
    pub decision: SafetyDecision,
    /// Triggered rules, in evaluation order
    pub reasons: Vec<String>,
    /// CMP score the review saw
    pub cmp_seen: Option<f64>,
    /// Release threshold in force during the review
    pub release_threshold: f64,
    /// Review time
    pub created_at: Time,
}

impl SafetyReport {
    /// Whether the review approved promotion.
    pub fn is_approved(&self) -> bool {
        self.decision == SafetyDecision::Approve
    }
}
