//! Evaluation pipeline for evoloop.
//!
//! The judge scores candidates along several dimensions, the benchmark
//! runner executes versioned task suites in the sandbox, and the safety
//! layer gates promotion.

#![warn(missing_docs)]

pub mod benchmark;
pub mod judge;
pub mod patterns;
pub mod safety;

pub use benchmark::{
    Benchmark, BenchmarkError, BenchmarkRunner, BenchmarkSuite, BenchmarkTask, SuiteAggregation,
    SuiteRegistry, TaskCheck,
};
pub use judge::{
    CorrectnessScorer, DimensionScorer, EfficiencyScorer, HeuristicJudge, Judge, JudgeContext,
    JudgeError, MaintainabilityScorer, SafetyScorer,
};
pub use patterns::{RiskPatterns, RuleHit};
pub use safety::{decide, PromotionApproval, RuleBasedSafetyLayer, SafetyLayer, SafetyOutcome};
