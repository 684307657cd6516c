//! Local process backend.
//!
//! Runs the candidate as a child process in its own process group with
//! `ulimit` ceilings, an empty environment and a read-only code directory.
//! It cannot isolate the network.

use async_trait::async_trait;
use evoloop_core::ExecutionLimits;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use crate::backend::{BackendCapabilities, ExecutionBackend};
use crate::context::{ExecutionContext, RuntimeSpec};
use crate::error::{Result, SandboxError};

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs candidates as local child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    /// Create a new process backend.
    pub fn new() -> Self {
        Self
    }

    /// Shell prologue applying the resource ceilings, then exec'ing the runtime.
    pub(crate) fn limit_script(limits: &ExecutionLimits) -> String {
        let memory_kib = (limits.memory_limit_bytes / 1024).max(1);
        let cpu_secs = (limits.timeout.as_secs_f64() * limits.cpu_quota).ceil().max(1.0) as u64;
        format!(
            "ulimit -v {} 2>/dev/null; ulimit -t {} 2>/dev/null; exec \"$0\" \"$@\"",
            memory_kib, cpu_secs
        )
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            network_isolation: false,
            memory_limit: cfg!(unix),
            resource_sampling: cfg!(target_os = "linux"),
        }
    }

    async fn create(
        &self,
        code: &str,
        runtime: &RuntimeSpec,
        _limits: &ExecutionLimits,
    ) -> Result<ExecutionContext> {
        let code = code.to_string();
        let runtime = runtime.clone();
        tokio::task::spawn_blocking(move || ExecutionContext::prepare(&code, &runtime))
            .await
            .map_err(|e| SandboxError::ContextCreation(e.to_string()))?
            .map_err(|e| SandboxError::ContextCreation(e.to_string()))
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        runtime: &RuntimeSpec,
        limits: &ExecutionLimits,
    ) -> Result<Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(Self::limit_script(limits))
            .arg(&runtime.program)
            .args(&runtime.args)
            .arg(ctx.entry_file())
            .current_dir(ctx.code_dir())
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", ctx.tmp_dir())
            .env("TMPDIR", ctx.tmp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SandboxError::BackendUnavailable(format!("sh: {}", e)),
            _ => SandboxError::Spawn(e.to_string()),
        })
    }

    async fn kill(&self, ctx: &ExecutionContext, child: &mut Child) -> Result<()> {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Negative pid targets the whole process group.
            let status = Command::new("kill")
                .args(["-KILL", "--", &format!("-{}", pid)])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = status {
                debug!(context = %ctx.id, error = %e, "Process group kill failed");
            }
        }
        match child.kill().await {
            Ok(()) => Ok(()),
            // Already reaped
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, ctx: ExecutionContext) -> Result<()> {
        let id = ctx.id.clone();
        tokio::task::spawn_blocking(move || ctx.cleanup())
            .await
            .map_err(|e| SandboxError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(|e| {
                warn!(context = %id, error = %e, "Failed to remove execution context");
                SandboxError::Io(e)
            })
    }
}
