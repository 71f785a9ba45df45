//! Core types shared across the sealbox sandbox.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceilings applied to one supervised run. Immutable once the run starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget for the supervised command, in milliseconds
    pub time_limit_ms: u64,
    /// Memory ceiling for the whole sandboxed process tree, in bytes
    pub memory_limit_bytes: u64,
    /// Maximum number of live processes/threads in the sandbox
    pub pid_limit: u32,
    /// Size of the pre-allocated stack handed to the namespace clone, in bytes
    pub stack_limit_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit_ms: 1000,
            memory_limit_bytes: 128 * 1024 * 1024,
            pid_limit: 16,
            stack_limit_bytes: 1024 * 1024,
        }
    }
}

/// Exit-code protocol relayed from the in-namespace monitor to the outer
/// supervisor. The boundary between them is a process exit status, not a
/// shared error channel, so the vocabulary is fixed here and any code
/// outside it maps to `UnknownError`.
pub const MONITOR_EXIT_OK: i32 = 0;
pub const MONITOR_EXIT_RUNTIME_ERROR: i32 = 1;
pub const MONITOR_EXIT_TIME_LIMIT: i32 = 2;
pub const MONITOR_EXIT_SIGNALED: i32 = 3;

/// Terminal classification of one run. Assigned exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Command exited zero within all limits
    #[serde(rename = "ok")]
    Ok,
    /// Command exited non-zero
    #[serde(rename = "runtime-error")]
    RuntimeError,
    /// Wall-clock budget exhausted (inner soft deadline or outer kill)
    #[serde(rename = "time-limit-exceeded")]
    TimeLimitExceeded,
    /// Command was killed by a signal (resource kill, forbidden behavior)
    #[serde(rename = "security-violation")]
    SecurityViolation,
    /// Host operator aborted the run
    #[serde(rename = "interrupted")]
    Interrupted,
    /// Supervision plumbing failed; the outcome is not attributable to the command
    #[serde(rename = "unknown-error")]
    UnknownError,
}

impl RunStatus {
    /// Status keyword as it appears on the first report line.
    pub fn keyword(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::RuntimeError => "runtime-error",
            RunStatus::TimeLimitExceeded => "time-limit-exceeded",
            RunStatus::SecurityViolation => "security-violation",
            RunStatus::Interrupted => "interrupted",
            RunStatus::UnknownError => "unknown-error",
        }
    }

    /// Map the monitor's relayed exit code onto a status.
    pub fn from_monitor_exit(code: i32) -> Self {
        match code {
            MONITOR_EXIT_OK => RunStatus::Ok,
            MONITOR_EXIT_RUNTIME_ERROR => RunStatus::RuntimeError,
            MONITOR_EXIT_TIME_LIMIT => RunStatus::TimeLimitExceeded,
            MONITOR_EXIT_SIGNALED => RunStatus::SecurityViolation,
            _ => RunStatus::UnknownError,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

/// Outcome of one supervised run, produced exactly once.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    /// Terminal classification
    pub status: RunStatus,
    /// Exit code of the in-namespace monitor, when it exited normally
    pub exit_code: Option<i32>,
    /// Signal that terminated the clone, when it did not exit normally
    pub signal: Option<i32>,
    /// Accumulated CPU time of the sandboxed tree, in milliseconds
    pub cpu_time_ms: u64,
    /// Peak memory of the sandboxed tree, in bytes
    pub peak_memory_bytes: u64,
}

impl ExecutionReport {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            exit_code: None,
            signal: None,
            cpu_time_ms: 0,
            peak_memory_bytes: 0,
        }
    }
}

/// Error taxonomy for sealbox operations.
///
/// Supervised-command outcomes are never errors; they are carried by
/// [`ExecutionReport`]. These variants cover the sandbox's own plumbing.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provisioning error: {0}")]
    Provision(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Namespace error: {0}")]
    Namespace(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type alias for sealbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_keywords_match_report_format() {
        assert_eq!(RunStatus::Ok.keyword(), "ok");
        assert_eq!(RunStatus::RuntimeError.keyword(), "runtime-error");
        assert_eq!(RunStatus::TimeLimitExceeded.keyword(), "time-limit-exceeded");
        assert_eq!(RunStatus::SecurityViolation.keyword(), "security-violation");
        assert_eq!(RunStatus::Interrupted.keyword(), "interrupted");
        assert_eq!(RunStatus::UnknownError.keyword(), "unknown-error");
    }

    #[test]
    fn monitor_exit_codes_map_to_statuses() {
        assert_eq!(RunStatus::from_monitor_exit(0), RunStatus::Ok);
        assert_eq!(RunStatus::from_monitor_exit(1), RunStatus::RuntimeError);
        assert_eq!(RunStatus::from_monitor_exit(2), RunStatus::TimeLimitExceeded);
        assert_eq!(RunStatus::from_monitor_exit(3), RunStatus::SecurityViolation);
        // Codes outside the protocol never masquerade as a command outcome.
        assert_eq!(RunStatus::from_monitor_exit(64), RunStatus::UnknownError);
        assert_eq!(RunStatus::from_monitor_exit(127), RunStatus::UnknownError);
    }

    #[test]
    fn status_serializes_as_keyword() {
        let json = serde_json::to_string(&RunStatus::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"time-limit-exceeded\"");
    }

    #[test]
    fn default_limits_are_sane() {
        let limits = ResourceLimits::default();
        assert!(limits.time_limit_ms > 0);
        assert!(limits.memory_limit_bytes > 0);
        assert!(limits.pid_limit > 0);
        assert!(limits.stack_limit_bytes >= 64 * 1024);
    }
}
