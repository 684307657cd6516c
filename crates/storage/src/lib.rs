//! Storage abstraction and implementations for evoloop.
//!
//! This crate provides the trajectory pool and key/value store traits with
//! in-memory and JSON-file implementations.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
mod memory;
mod stats;

pub use trait_::{KeyValueStore, Result, StorageError, TrajectoryPool};
pub use json_storage::{JsonKvStore, JsonTrajectoryPool};
pub use memory::{InMemoryKvStore, InMemoryPool};
pub use stats::{OperatorOutcomes, OperatorStats};
