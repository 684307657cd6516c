//! Evoloop core data models.
//!
//! This crate defines the records the evolution engine passes between its
//! layers: trajectories and their state machine, sandbox results, judge and
//! benchmark scores, safety reports, checkpoints and the evolution policy.

#![warn(missing_docs)]

// Core identities
mod id;
mod error;

// Evolution attempts
mod trajectory;
mod operator;
mod execution;

// Scoring and gating
mod score;
mod safety;
mod checkpoint;

// Configuration and ordering
mod policy;
pub mod ranking;

// Re-exports
pub use id::*;
pub use error::{IntegrityError, Result};

pub use trajectory::{
    Trajectory, TrajectoryStatus, TrajectoryFilter, OperatorKind, CodeArtifact, ResultFields,
};
pub use operator::OperatorResult;
pub use execution::{SandboxResult, SandboxStatus, ResourceUsage, ExecutionLimits, duration_secs};

pub use score::{Aggregation, JudgeScore, TaskOutcome, BenchmarkResult};
pub use safety::{RiskLevel, SafetyDecision, SafetyReport};
pub use checkpoint::{Checkpoint, CheckpointMetrics, QualityTier};

pub use policy::{
    MAX_PARALLEL, EvolutionPolicy, PolicyError, JudgePolicy, OperatorThresholds, SafetyPolicy,
    OrchestrationPolicy, BudgetPolicy, RetryPolicy, Capabilities, WarmStartPolicy,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
