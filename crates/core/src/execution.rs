//! Sandbox execution records.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a sandbox run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    /// Process exited with status 0
    Completed,
    /// Process exited with a non-zero status
    Failed,
    /// Wall-clock limit hit; the process was killed
    Timeout,
    /// Process was terminated by a signal (resource limit, OOM)
    Killed,
}

/// Resource usage observed during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Peak resident memory in bytes
    pub peak_memory_bytes: Option<u64>,
    /// User + system CPU time
    pub cpu_time: Option<Duration>,
}

impl ResourceUsage {
    /// Ordering key used when breaking ties (lower is better).
    ///
    /// Unknown values sort last.
    pub fn cost_key(&self) -> (u64, u128) {
        (
            self.peak_memory_bytes.unwrap_or(u64::MAX),
            self.cpu_time.map(|d| d.as_micros()).unwrap_or(u128::MAX),
        )
    }
}

/// Outcome of one sandbox run. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// Exit code (None when killed by a signal or timed out)
    pub exit_code: Option<i32>,
    /// Captured standard output (bounded)
    pub stdout: String,
    /// Captured standard error (bounded)
    pub stderr: String,
    /// Wall-clock duration
    pub execution_time: Duration,
    /// Observed resource usage
    pub resource_usage: ResourceUsage,
    /// How the run ended
    pub status: SandboxStatus,
}

impl SandboxResult {
    /// Whether the run completed with exit status 0.
    pub fn succeeded(&self) -> bool {
        self.status == SandboxStatus::Completed
    }

    /// Last `max_lines` lines of stderr, for diagnostics.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Resource limits for one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Hard wall-clock timeout
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Memory limit in bytes
    pub memory_limit_bytes: u64,
    /// CPU quota in cores (1.0 = one full core)
    pub cpu_quota: f64,
    /// Whether network access is disabled
    pub network_disabled: bool,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            memory_limit_bytes: 512 * 1024 * 1024,
            cpu_quota: 1.0,
            network_disabled: true,
        }
    }
}

/// Serde helper: durations as fractional seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as f64 seconds.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    /// Deserialize from f64 seconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration {secs}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_key_unknown_sorts_last() {
        let known = ResourceUsage {
            peak_memory_bytes: Some(1024),
            cpu_time: Some(Duration::from_millis(5)),
        };
        assert!(known.cost_key() < ResourceUsage::default().cost_key());
    }

    #[test]
    fn test_stderr_tail() {
        let result = SandboxResult {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "a\nb\nc\nd".to_string(),
            execution_time: Duration::ZERO,
            resource_usage: ResourceUsage::default(),
            status: SandboxStatus::Failed,
        };
        assert_eq!(result.stderr_tail(2), "c\nd");
        assert!(!result.succeeded());
    }

    #[test]
    fn test_limits_json_uses_seconds() {
        let limits = ExecutionLimits::default();
        let json = serde_json::to_value(&limits).unwrap();
        assert_eq!(json["timeout"], 30.0);
        let back: ExecutionLimits = serde_json::from_value(json).unwrap();
        assert_eq!(back, limits);
    }
}
