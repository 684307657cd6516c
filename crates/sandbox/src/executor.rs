//! Sandbox executor.
//!
//! Every run gets a fresh context from the backend. The context is released
//! on every exit path: explicitly after the run, and from `Drop` if the
//! future is cancelled or panics midway.

use evoloop_core::{ExecutionLimits, ResourceUsage, SandboxResult, SandboxStatus};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use crate::backend::ExecutionBackend;
use crate::capture::{read_bounded, DEFAULT_OUTPUT_CAP};
use crate::context::{ExecutionContext, RuntimeSpec};
use crate::error::{Result, SandboxError};
use crate::resource;

const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

// Grace period for pipe readers after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Releases a context when dropped, unless released explicitly first.
struct ContextGuard {
    backend: Arc<dyn ExecutionBackend>,
    ctx: Option<ExecutionContext>,
}

impl ContextGuard {
    fn new(backend: Arc<dyn ExecutionBackend>, ctx: ExecutionContext) -> Self {
        Self {
            backend,
            ctx: Some(ctx),
        }
    }

    fn ctx(&self) -> Option<&ExecutionContext> {
        self.ctx.as_ref()
    }

    async fn release(mut self) {
        if let Some(ctx) = self.ctx.take() {
            let id = ctx.id.clone();
            match self.backend.remove(ctx).await {
                Ok(()) => debug!(context = %id, "Released execution context"),
                Err(e) => warn!(context = %id, error = %e, "Failed to release execution context"),
            }
        }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            debug!(context = %ctx.id, "Releasing execution context from drop");
            self.backend.remove_detached(ctx);
        }
    }
}

/// Runs untrusted code through an [`ExecutionBackend`].
pub struct SandboxExecutor {
    backend: Arc<dyn ExecutionBackend>,
    runtime: RuntimeSpec,
    output_cap: usize,
    allow_unisolated_network: bool,
}

impl SandboxExecutor {
    /// Create an executor over `backend` with the default runtime.
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            runtime: RuntimeSpec::default(),
            output_cap: DEFAULT_OUTPUT_CAP,
            allow_unisolated_network: false,
        }
    }

    /// Use a different interpreter.
    pub fn with_runtime(mut self, runtime: RuntimeSpec) -> Self {
        self.runtime = runtime;
        self
    }

    /// Per-stream capture cap in bytes.
    pub fn with_output_cap(mut self, cap: usize) -> Self {
        self.output_cap = cap;
        self
    }

    /// Permit `network_disabled` runs on backends that cannot isolate the network.
    pub fn allow_unisolated_network(mut self, allow: bool) -> Self {
        self.allow_unisolated_network = allow;
        self
    }

    /// Runtime in use.
    pub fn runtime(&self) -> &RuntimeSpec {
        &self.runtime
    }

    /// Backend name.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Run `code` under `limits`.
    ///
    /// Candidate failures (non-zero exit, signal, timeout) are reported in the
    /// result's status. `Err` means the sandbox itself could not run.
    pub async fn execute(&self, code: &str, limits: &ExecutionLimits) -> Result<SandboxResult> {
        let caps = self.backend.capabilities();
        if limits.network_disabled && !caps.network_isolation && !self.allow_unisolated_network {
            return Err(SandboxError::IsolationUnavailable {
                backend: self.backend.name().to_string(),
            });
        }

        let ctx = self.backend.create(code, &self.runtime, limits).await?;
        let guard = ContextGuard::new(self.backend.clone(), ctx);
        let result = match guard.ctx() {
            Some(ctx) => self.run_in(ctx, limits, caps.resource_sampling).await,
            None => Err(SandboxError::ContextCreation("context already released".into())),
        };
        guard.release().await;
        result
    }

    /// Run `code` with `test_code` appended as its harness.
    pub async fn execute_tests(
        &self,
        code: &str,
        test_code: &str,
        limits: &ExecutionLimits,
    ) -> Result<SandboxResult> {
        let mut bundle = String::with_capacity(code.len() + test_code.len() + 2);
        bundle.push_str(code);
        if !code.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push('\n');
        bundle.push_str(test_code);
        self.execute(&bundle, limits).await
    }

    /// Static syntax check without executing the code.
    ///
    /// Uses the runtime's checker when it is available, otherwise a
    /// delimiter-balance scan.
    pub async fn validate_syntax(&self, code: &str) -> (bool, Option<String>) {
        if code.trim().is_empty() {
            return (false, Some("empty code artifact".to_string()));
        }
        if code.contains('\0') {
            return (false, Some("code contains NUL bytes".to_string()));
        }

        if let Some(check) = &self.runtime.syntax_check {
            match self.run_syntax_checker(check, code).await {
                Ok(verdict) => return verdict,
                Err(e) => debug!(error = %e, "Syntax checker unavailable, using delimiter scan"),
            }
        }
        match check_delimiters(code) {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        }
    }

    async fn run_syntax_checker(&self, check: &[String], code: &str) -> Result<(bool, Option<String>)> {
        let (program, args) = check
            .split_first()
            .ok_or_else(|| SandboxError::BackendUnavailable("empty syntax check command".into()))?;
        let scratch = tempfile::tempdir()?;
        let path = scratch.path().join(&self.runtime.entry_file);
        tokio::fs::write(&path, code).await?;

        let run = Command::new(program)
            .args(args)
            .arg(&path)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(SYNTAX_CHECK_TIMEOUT, run).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(SandboxError::BackendUnavailable(format!("{}: {}", program, e))),
            Err(_) => return Ok((false, Some("syntax check timed out".to_string()))),
        };

        if output.status.success() {
            Ok((true, None))
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() { "syntax error".to_string() } else { stderr };
            Ok((false, Some(message)))
        }
    }

    async fn run_in(
        &self,
        ctx: &ExecutionContext,
        limits: &ExecutionLimits,
        sample: bool,
    ) -> Result<SandboxResult> {
        let start = Instant::now();
        let mut child = self.backend.spawn(ctx, &self.runtime, limits).await?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Spawn("stdout not piped".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Spawn("stderr not piped".into()))?;
        let cap = self.output_cap;
        let out_task = tokio::spawn(read_bounded(stdout, cap));
        let err_task = tokio::spawn(read_bounded(stderr, cap));

        let (stop_tx, stop_rx) = oneshot::channel();
        let sampler = match (sample, child.id()) {
            (true, Some(pid)) => Some(tokio::spawn(resource::sample_until(pid, stop_rx))),
            _ => None,
        };

        let waited = tokio::time::timeout(limits.timeout, child.wait()).await;
        let execution_time = start.elapsed();

        // Always stop the process group, so nothing the candidate started outlives the run.
        let kill_result = self.backend.kill(ctx, &mut child).await;

        let (exit_code, status) = match waited {
            Ok(Ok(exit)) => self.backend.classify_exit(exit),
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                if let Err(e) = kill_result {
                    warn!(context = %ctx.id, error = %e, "Failed to kill timed-out candidate");
                }
                info!(context = %ctx.id, timeout_ms = limits.timeout.as_millis() as u64, "Sandbox run timed out");
                (None, SandboxStatus::Timeout)
            }
        };

        let _ = stop_tx.send(());
        let resource_usage = match sampler {
            Some(handle) => handle.await.unwrap_or_default(),
            None => ResourceUsage::default(),
        };

        let stdout = drain(out_task).await;
        let stderr = drain(err_task).await;

        debug!(
            context = %ctx.id,
            ?status,
            exit_code = ?exit_code,
            elapsed_ms = execution_time.as_millis() as u64,
            "Sandbox run finished"
        );

        Ok(SandboxResult {
            exit_code,
            stdout,
            stderr,
            execution_time,
            resource_usage,
            status,
        })
    }
}

async fn drain(task: tokio::task::JoinHandle<std::io::Result<String>>) -> String {
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(Ok(text))) => text,
        Ok(Ok(Err(e))) => format!("[capture error: {}]", e),
        Ok(Err(e)) => format!("[capture error: {}]", e),
        Err(_) => "[capture abandoned: stream still open]".to_string(),
    }
}

/// Balanced `()[]{}` outside string literals and `#` comments.
pub fn check_delimiters(code: &str) -> std::result::Result<(), String> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut comment = false;
    let mut line = 1;

    for c in code.chars() {
        if c == '\n' {
            line += 1;
            comment = false;
        }
        if comment {
            continue;
        }
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '#' => comment = true,
            '"' | '\'' => quote = Some(c),
            '(' | '[' | '{' => stack.push((c, line)),
            ')' | ']' | '}' => {
                let want = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == want => {}
                    Some((open, at)) => {
                        return Err(format!("line {}: '{}' closes '{}' opened on line {}", line, c, open, at))
                    }
                    None => return Err(format!("line {}: unmatched '{}'", line, c)),
                }
            }
            _ => {}
        }
    }

    if let Some(q) = quote {
        return Err(format!("unterminated {} string", q));
    }
    if let Some((open, at)) = stack.pop() {
        return Err(format!("line {}: '{}' never closed", at, open));
    }
    Ok(())
}
