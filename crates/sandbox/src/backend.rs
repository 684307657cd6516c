//! Execution backend abstraction.

use async_trait::async_trait;
use evoloop_core::{ExecutionLimits, SandboxStatus};
use std::process::ExitStatus;
use tokio::process::Child;
use crate::context::{ExecutionContext, RuntimeSpec};
use crate::error::Result;

/// What a backend can enforce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Can cut the candidate off from the network
    pub network_isolation: bool,
    /// Can enforce a memory ceiling
    pub memory_limit: bool,
    /// The spawned pid is the candidate itself, so `/proc` sampling is meaningful
    pub resource_sampling: bool,
}

/// An isolated, disposable execution environment.
///
/// `create` prepares a context, `spawn` starts the candidate in it with
/// piped stdout/stderr, `kill` stops it and everything it started, and
/// `remove` releases the context.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Backend name, for logs and errors.
    fn name(&self) -> &str;

    /// What this backend enforces.
    fn capabilities(&self) -> BackendCapabilities;

    /// Prepare a fresh context holding `code`.
    async fn create(
        &self,
        code: &str,
        runtime: &RuntimeSpec,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionContext>;

    /// Start the candidate. stdout and stderr must be piped.
    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        runtime: &RuntimeSpec,
        limits: &ExecutionLimits,
    ) -> Result<Child>;

    /// Forcibly stop the candidate and anything it spawned.
    async fn kill(&self, ctx: &ExecutionContext, child: &mut Child) -> Result<()>;

    /// Release the context and its filesystem state.
    async fn remove(&self, ctx: ExecutionContext) -> Result<()>;

    /// Release a context from a synchronous drop path.
    fn remove_detached(&self, ctx: ExecutionContext) {
        drop(ctx);
    }

    /// Map a process exit status to the sandbox outcome.
    fn classify_exit(&self, status: ExitStatus) -> (Option<i32>, SandboxStatus) {
        match status.code() {
            Some(0) => (Some(0), SandboxStatus::Completed),
            Some(code) => (Some(code), SandboxStatus::Failed),
            // Terminated by a signal (rlimit, OOM killer)
            None => (None, SandboxStatus::Killed),
        }
    }
}
