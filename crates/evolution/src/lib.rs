//! Evolution layer - operators, selection and checkpoints.
//!
//! Turns scored trajectories into the next generation's candidates and
//! keeps the promoted versions each run can warm-start from.

#![warn(missing_docs)]

mod synthesis;
mod operators;
mod selection;
mod checkpoint;
mod calibration;
mod cache;

pub use synthesis::{extract_code, CodeSynthesizer, CommandSynthesizer, SynthesisError};
pub use operators::{FailureDiagnosis, OperatorError, OperatorSet};
pub use selection::{OperatorSelector, PlannedOperation, SelectionError};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use calibration::{actual_improvement, expected_improvement, CalibrationRecord, CalibrationStore};
pub use cache::ArtifactCache;
