//! Operator set: Revision, Recombination, Refinement.

use evoloop_core::{CodeArtifact, OperatorKind, OperatorResult, Trajectory, TrajectoryStatus};
use std::sync::Arc;
use tracing::debug;
use crate::synthesis::{CodeSynthesizer, SynthesisError};

/// Errors applying an operator.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    /// The synthesis collaborator failed
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// Wrong number of parents for the operator
    #[error("{operator} needs {expected} parent(s), got {actual}")]
    Arity {
        /// Operator
        operator: OperatorKind,
        /// Required parents
        expected: usize,
        /// Parents given
        actual: usize,
    },

    /// The operator does not transform parents
    #[error("{0} is not a mutation operator")]
    NotApplicable(OperatorKind),
}

const STDERR_TAIL_LINES: usize = 20;

/// Why a parent scored poorly, fed to Revision.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureDiagnosis {
    /// One-line summary
    pub summary: String,
    /// Supporting evidence
    pub details: Vec<String>,
}

impl FailureDiagnosis {
    /// Diagnose `parent` from its status, sandbox run and judge score.
    pub fn of(parent: &Trajectory) -> Self {
        let mut details = Vec::new();

        let summary = match parent.status {
            TrajectoryStatus::TimedOut => "exceeded the wall-clock limit".to_string(),
            TrajectoryStatus::Failed => match &parent.failure_reason {
                Some(reason) => format!("failed: {}", reason),
                None => "failed without a usable result".to_string(),
            },
            _ => match parent.judge_score.as_ref().and_then(|j| j.weakest_dimension()) {
                Some((dim, score)) => format!("weakest dimension is {} ({:.2})", dim, score),
                None => "scored below the revision threshold".to_string(),
            },
        };

        if let Some(run) = &parent.sandbox_result {
            match run.exit_code {
                Some(code) => details.push(format!("exit code {}", code)),
                None => details.push(format!("no exit code ({:?})", run.status).to_lowercase()),
            }
            let tail = run.stderr_tail(STDERR_TAIL_LINES);
            if !tail.trim().is_empty() {
                details.push(format!("stderr:\n{}", tail));
            }
        }
        if let Some(cmp) = parent.cmp_score {
            details.push(format!("cmp {:.3}", cmp));
        }

        Self { summary, details }
    }

    /// Text form for the synthesis prompt.
    pub fn render(&self) -> String {
        let mut out = format!("Diagnosis: {}", self.summary);
        for d in &self.details {
            out.push('\n');
            out.push_str(d);
        }
        out
    }
}

/// Applies operators through the synthesis collaborator.
pub struct OperatorSet {
    synthesizer: Arc<dyn CodeSynthesizer>,
    problem_description: String,
}

impl OperatorSet {
    /// Create an operator set for one problem.
    pub fn new(synthesizer: Arc<dyn CodeSynthesizer>, problem_description: impl Into<String>) -> Self {
        Self {
            synthesizer,
            problem_description: problem_description.into(),
        }
    }

    /// Problem being solved.
    pub fn problem_description(&self) -> &str {
        &self.problem_description
    }

    /// A fresh seed variant of `initial`. `variant` distinguishes siblings.
    pub async fn seed(&self, initial: &CodeArtifact, variant: usize) -> Result<OperatorResult, OperatorError> {
        let context = format!(
            "Write an alternative solution (variant {}).\n\n## Starting point\n{}",
            variant,
            initial.as_str()
        );
        let code = self.synthesizer.synthesize(&self.problem_description, &context).await?;
        Ok(OperatorResult {
            code_artifact: CodeArtifact::new(code),
            operator: OperatorKind::Seed,
            rationale: format!("seed variant {}", variant),
            parent_ids: Vec::new(),
        })
    }

    /// Apply `operator` to `parents`.
    pub async fn apply(&self, operator: OperatorKind, parents: &[&Trajectory]) -> Result<OperatorResult, OperatorError> {
        let expected = operator.parent_count();
        if parents.len() != expected {
            return Err(OperatorError::Arity {
                operator,
                expected,
                actual: parents.len(),
            });
        }

        let (context, rationale) = match operator {
            OperatorKind::Revision => revision_context(parents[0]),
            OperatorKind::Recombination => recombination_context(parents[0], parents[1]),
            OperatorKind::Refinement => refinement_context(parents[0]),
            OperatorKind::Seed => return Err(OperatorError::NotApplicable(operator)),
        };

        debug!(%operator, parents = ?parents.iter().map(|p| p.id.to_string()).collect::<Vec<_>>(), "Applying operator");
        let code = self.synthesizer.synthesize(&self.problem_description, &context).await?;
        Ok(OperatorResult {
            code_artifact: CodeArtifact::new(code),
            operator,
            rationale,
            parent_ids: parents.iter().map(|p| p.id).collect(),
        })
    }
}

fn revision_context(parent: &Trajectory) -> (String, String) {
    let diagnosis = FailureDiagnosis::of(parent);
    let context = format!(
        "The previous attempt scored poorly. Take a different approach.\n\n{}\n\n## Previous attempt\n{}",
        diagnosis.render(),
        parent.code_artifact.as_str()
    );
    let rationale = format!("revision of {}: {}", parent.id, diagnosis.summary);
    (context, rationale)
}

fn recombination_context(a: &Trajectory, b: &Trajectory) -> (String, String) {
    let context = format!(
        "Two strong solutions follow. Merge their distinguishing strengths into one.\n\n## Solution A (cmp {})\n{}\n\n## Solution B (cmp {})\n{}",
        fmt_cmp(a.cmp_score),
        a.code_artifact.as_str(),
        fmt_cmp(b.cmp_score),
        b.code_artifact.as_str()
    );
    let rationale = format!(
        "recombination of {} (cmp {}) and {} (cmp {})",
        a.id,
        fmt_cmp(a.cmp_score),
        b.id,
        fmt_cmp(b.cmp_score)
    );
    (context, rationale)
}

fn refinement_context(parent: &Trajectory) -> (String, String) {
    let target = parent
        .judge_score
        .as_ref()
        .and_then(|j| j.weakest_dimension())
        .map(|(dim, _)| dim.to_string())
        .unwrap_or_else(|| "overall quality".to_string());
    let context = format!(
        "Keep the approach. Make a targeted improvement to {}.\n\n## Current solution (cmp {})\n{}",
        target,
        fmt_cmp(parent.cmp_score),
        parent.code_artifact.as_str()
    );
    let rationale = format!("refinement of {} targeting {}", parent.id, target);
    (context, rationale)
}

fn fmt_cmp(cmp: Option<f64>) -> String {
    cmp.map(|c| format!("{:.3}", c)).unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evoloop_core::{Aggregation, JudgeScore, ResourceUsage, RunId, SandboxResult, SandboxStatus};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns a fixed answer and remembers the contexts it saw.
    struct Recorder {
        contexts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CodeSynthesizer for Recorder {
        async fn synthesize(&self, _problem: &str, context: &str) -> Result<String, SynthesisError> {
            self.contexts.lock().unwrap().push(context.to_string());
            Ok("new code".to_string())
        }
    }

    fn recorder() -> Arc<Recorder> {
        Arc::new(Recorder { contexts: Mutex::new(Vec::new()) })
    }

    fn parent(cmp: f64) -> Trajectory {
        let mut t = Trajectory::propose(RunId::new(), "agent", 0, OperatorKind::Seed, vec![], CodeArtifact::new("old code"), "seed");
        let mut dimensions = BTreeMap::new();
        dimensions.insert("correctness".to_string(), cmp);
        dimensions.insert("efficiency".to_string(), 0.1);
        t.cmp_score = Some(cmp);
        t.judge_score = Some(JudgeScore { dimensions, cmp, aggregation: Aggregation::WeightedMean });
        t.status = TrajectoryStatus::Judged;
        t
    }

    #[tokio::test]
    async fn test_arity_checked() {
        let ops = OperatorSet::new(recorder(), "problem");
        let p = parent(0.9);
        let err = ops.apply(OperatorKind::Recombination, &[&p]).await.unwrap_err();
        assert!(matches!(err, OperatorError::Arity { expected: 2, actual: 1, .. }));
        assert!(matches!(
            ops.apply(OperatorKind::Seed, &[]).await,
            Err(OperatorError::NotApplicable(OperatorKind::Seed))
        ));
    }

    #[tokio::test]
    async fn test_recombination_carries_both_parents() {
        let synth = recorder();
        let ops = OperatorSet::new(synth.clone(), "problem");
        let (a, b) = (parent(0.92), parent(0.88));
        let result = ops.apply(OperatorKind::Recombination, &[&a, &b]).await.unwrap();
        assert_eq!(result.parent_ids, vec![a.id, b.id]);
        assert_eq!(result.operator, OperatorKind::Recombination);
        let ctx = &synth.contexts.lock().unwrap()[0];
        assert!(ctx.contains("cmp 0.920") && ctx.contains("cmp 0.880"));
    }

    #[tokio::test]
    async fn test_refinement_targets_weakest_dimension() {
        let synth = recorder();
        let ops = OperatorSet::new(synth.clone(), "problem");
        let result = ops.apply(OperatorKind::Refinement, &[&parent(0.6)]).await.unwrap();
        assert!(result.rationale.ends_with("targeting efficiency"));
    }

    #[test]
    fn test_diagnosis_of_timeout_and_failure() {
        let mut t = parent(0.1);
        t.status = TrajectoryStatus::TimedOut;
        t.sandbox_result = Some(SandboxResult {
            exit_code: None,
            stdout: String::new(),
            stderr: "working...\nstill working".into(),
            execution_time: Duration::from_secs(30),
            resource_usage: ResourceUsage::default(),
            status: SandboxStatus::Timeout,
        });
        let d = FailureDiagnosis::of(&t);
        assert_eq!(d.summary, "exceeded the wall-clock limit");
        assert!(d.render().contains("still working"));

        t.status = TrajectoryStatus::Failed;
        t.failure_reason = Some("ModuleNotFoundError".into());
        assert_eq!(FailureDiagnosis::of(&t).summary, "failed: ModuleNotFoundError");
    }
}
