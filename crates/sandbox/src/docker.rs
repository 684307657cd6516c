//! Container backend driving the `docker` CLI.

use async_trait::async_trait;
use evoloop_core::{ExecutionLimits, SandboxStatus};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use crate::backend::{BackendCapabilities, ExecutionBackend};
use crate::context::{ExecutionContext, RuntimeSpec};
use crate::error::{Result, SandboxError};

/// Runs each candidate in a throwaway container.
///
/// The code directory is bind-mounted read-only at `/workspace`; the root
/// filesystem is read-only with a tmpfs at `/tmp`.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    binary: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerBackend {
    /// Create a backend using `docker` from PATH.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Arguments for `docker create`.
    pub fn create_args(ctx: &ExecutionContext, runtime: &RuntimeSpec, limits: &ExecutionLimits) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            ctx.id.clone(),
            "--memory".to_string(),
            format!("{}b", limits.memory_limit_bytes),
            "--memory-swap".to_string(),
            format!("{}b", limits.memory_limit_bytes),
            "--cpus".to_string(),
            format!("{}", limits.cpu_quota),
            "--pids-limit".to_string(),
            "256".to_string(),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
            "--env".to_string(),
            "HOME=/tmp".to_string(),
            "--volume".to_string(),
            format!("{}:/workspace:ro", ctx.code_dir().display()),
            "--workdir".to_string(),
            "/workspace".to_string(),
        ];
        if limits.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }
        args.push(runtime.image.clone());
        args.push(runtime.program.clone());
        args.extend(runtime.args.iter().cloned());
        args.push(format!("/workspace/{}", ctx.entry_file()));
        args
    }

    async fn docker(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SandboxError::BackendUnavailable(format!("{}: {}", self.binary, e)))
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            network_isolation: true,
            memory_limit: true,
            resource_sampling: false,
        }
    }

    async fn create(
        &self,
        code: &str,
        runtime: &RuntimeSpec,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionContext> {
        let ctx = ExecutionContext::prepare(code, runtime)
            .map_err(|e| SandboxError::ContextCreation(e.to_string()))?;

        let args = Self::create_args(&ctx, runtime, limits);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.docker(&refs).await?;
        if !output.status.success() {
            return Err(SandboxError::ContextCreation(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        debug!(context = %ctx.id, image = %runtime.image, "Created container");
        Ok(ctx)
    }

    async fn spawn(
        &self,
        ctx: &ExecutionContext,
        _runtime: &RuntimeSpec,
        _limits: &ExecutionLimits,
    ) -> Result<Child> {
        Command::new(&self.binary)
            .args(["start", "--attach", &ctx.id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn(e.to_string()))
    }

    async fn kill(&self, ctx: &ExecutionContext, child: &mut Child) -> Result<()> {
        let output = self.docker(&["kill", &ctx.id]).await?;
        if !output.status.success() {
            debug!(context = %ctx.id, "docker kill: container already stopped");
        }
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, ctx: ExecutionContext) -> Result<()> {
        let output = self.docker(&["rm", "--force", &ctx.id]).await;
        let fs = ctx.cleanup();
        match output {
            Ok(out) if !out.status.success() => {
                warn!(stderr = %String::from_utf8_lossy(&out.stderr).trim(), "docker rm failed");
            }
            Err(e) => warn!(error = %e, "docker rm failed"),
            Ok(_) => {}
        }
        fs.map_err(SandboxError::Io)
    }

    fn remove_detached(&self, ctx: ExecutionContext) {
        let binary = self.binary.clone();
        let id = ctx.id.clone();
        std::thread::spawn(move || {
            let _ = std::process::Command::new(binary)
                .args(["rm", "--force", &id])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        });
        drop(ctx);
    }

    fn classify_exit(&self, status: ExitStatus) -> (Option<i32>, SandboxStatus) {
        match status.code() {
            Some(0) => (Some(0), SandboxStatus::Completed),
            // 128 + signal: killed inside the container (OOM is 137)
            Some(code) if code > 128 && code <= 128 + 64 => (None, SandboxStatus::Killed),
            Some(code) => (Some(code), SandboxStatus::Failed),
            None => (None, SandboxStatus::Killed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args_isolate_network_and_mount_readonly() {
        let runtime = RuntimeSpec::python();
        let ctx = ExecutionContext::prepare("print(1)", &runtime).unwrap();
        let args = DockerBackend::create_args(&ctx, &runtime, &ExecutionLimits::default());

        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains(&format!("{}:/workspace:ro", ctx.code_dir().display())));
        assert!(joined.contains(&format!("--memory {}b", 512 * 1024 * 1024)));
        assert_eq!(args.last().map(String::as_str), Some("/workspace/main.py"));
    }

    #[test]
    fn test_network_flag_omitted_when_allowed() {
        let runtime = RuntimeSpec::shell();
        let ctx = ExecutionContext::prepare("true", &runtime).unwrap();
        let limits = ExecutionLimits {
            network_disabled: false,
            ..Default::default()
        };
        let args = DockerBackend::create_args(&ctx, &runtime, &limits);
        assert!(!args.iter().any(|a| a == "--network"));
    }
}
