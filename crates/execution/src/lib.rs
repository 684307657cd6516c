//! Execution layer - the evolution control loop.
//!
//! [`EvolutionEngine`] drives a run: it seeds generation zero, evaluates
//! each generation as one bounded-parallel batch, routes qualifying
//! candidates through the safety layer, plans the next generation's
//! operators and promotes the best approved candidate at the end.

#![warn(missing_docs)]

mod budget;
mod convergence;
mod pipeline;
mod batch;
mod outcome;
mod error;
mod engine;

pub use budget::{Budget, BudgetTracker, Exhaustion};
pub use convergence::PlateauDetector;
pub use pipeline::{Pipeline, Verdict};
pub use batch::{run_batch, BatchReport};
pub use outcome::{EvolutionOutcome, IterationSummary, Promotion, RunStatus, StatusCounts};
pub use error::{EngineError, Result};
pub use engine::{Collaborators, EvolutionEngine, RunRequest};
