//! Sandbox executor for evoloop.
//!
//! Runs untrusted candidate code in a fresh, resource-limited execution
//! context and reports exit status, bounded output, timing and resource usage.

#![warn(missing_docs)]

mod backend;
mod capture;
mod context;
mod docker;
mod error;
mod executor;
mod process;
mod resource;

pub use backend::{BackendCapabilities, ExecutionBackend};
pub use capture::{read_bounded, DEFAULT_OUTPUT_CAP};
pub use context::{ExecutionContext, RuntimeSpec};
pub use docker::DockerBackend;
pub use error::{Result, SandboxError};
pub use executor::{check_delimiters, SandboxExecutor};
pub use process::ProcessBackend;
