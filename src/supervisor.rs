//! Outer supervisor: owns the resource scope, creates the namespace clone,
//! and classifies its fate against the authoritative deadline.
//!
//! Sequencing is the whole game here. The interrupt record is armed as
//! soon as the scope exists; the clone is attached and registered as the
//! kill target while still parked on the start gate; only then does the
//! gate open. On the way out the scope is read and destroyed on every
//! path, classified or not, and only then is the record cleared.

use crate::cgroup::{self, ResourceScope};
use crate::container::{self, ContainerRequest};
use crate::interrupt;
use crate::types::{ExecutionReport, ResourceLimits, Result, RunStatus};
use nix::errno::Errno;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, pipe, Pid};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Hard allowance on top of the time limit before the outer kill. Wider
/// than the monitor's soft grace so a self-detected timeout usually gets
/// to report itself first.
const OUTER_GRACE_MS: u64 = 1000;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One supervised execution against an already provisioned environment.
pub struct RunRequest {
    /// Provisioned sandbox root
    pub target: PathBuf,
    /// Control root the resource scope is created under
    pub scope_root: PathBuf,
    pub limits: ResourceLimits,
    /// Worker stdio paths, resolved inside the namespace
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Command path plus arguments
    pub command: Vec<String>,
    /// Use the legacy split-controller hierarchy even if v2 is mounted
    pub force_cgroup_v1: bool,
}

/// Execute and supervise one run. Produces exactly one report; the scope
/// is destroyed on every exit path, including classification failures.
pub fn run(request: &RunRequest) -> Result<ExecutionReport> {
    let scope =
        cgroup::create_scope(&request.scope_root, &request.limits, request.force_cgroup_v1)?;
    log::info!(
        "created {} scope {} for {:?}",
        scope.generation().name(),
        scope.id(),
        request.command
    );

    // Arm the interrupt record before anything else can fail; a signal
    // from here on always finds the scope directories to remove.
    let outcome =
        interrupt::arm(&scope.control_dirs()).and_then(|_| supervise(request, scope.as_ref()));

    let usage = scope.read_usage();
    if let Err(e) = scope.destroy() {
        // A leaked scope is a host resource leak; surface it even when
        // the run itself classified fine.
        log::warn!("failed to destroy scope {}: {}", scope.id(), e);
    }
    // Handlers stay live until the scope is gone; a signal in between
    // still removes it.
    interrupt::disarm();

    let (status, exit_code, signal) = outcome?;
    let mut report = ExecutionReport::new(status);
    report.exit_code = exit_code;
    report.signal = signal;
    report.cpu_time_ms = usage.cpu_time_ms;
    report.peak_memory_bytes = usage.peak_memory_bytes;
    Ok(report)
}

fn supervise(
    request: &RunRequest,
    scope: &dyn ResourceScope,
) -> Result<(RunStatus, Option<i32>, Option<i32>)> {
    let (gate_read, gate_write) = pipe()?;

    let container_request = ContainerRequest {
        target: request.target.clone(),
        stdin_path: request.stdin_path.clone(),
        stdout_path: request.stdout_path.clone(),
        stderr_path: request.stderr_path.clone(),
        command: request.command.clone(),
        time_limit_ms: request.limits.time_limit_ms,
    };

    // Dedicated stack region for the clone. The worker lifts the limit
    // again before exec, so this only has to carry the monitor.
    let mut stack = vec![0u8; request.limits.stack_limit_bytes];
    let flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWUTS;

    let clone_result = unsafe {
        clone(
            Box::new(|| container::container_main(&container_request, gate_read, gate_write)),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    };
    let clone_pid = match clone_result {
        Ok(pid) => pid,
        Err(e) => {
            let _ = close(gate_read);
            let _ = close(gate_write);
            return Err(e.into());
        }
    };
    log::debug!("cloned namespace process {}", clone_pid);

    // The clone is parked on the gate until our write end closes. Register
    // the kill target and attach first so it can never fork unaccounted or
    // outrun the interrupt record.
    interrupt::register_pid(clone_pid);
    if let Err(e) = scope.attach(clone_pid.as_raw()) {
        // Still parked; nothing untrusted has run yet.
        let _ = kill(clone_pid, Signal::SIGKILL);
        let _ = close(gate_read);
        let _ = close(gate_write);
        let _ = waitpid(clone_pid, None);
        return Err(e);
    }
    let _ = close(gate_read);
    // Opens the gate.
    let _ = close(gate_write);

    poll_clone(clone_pid, request.limits.time_limit_ms)
}

/// Poll the clone at a fixed interval against the hard deadline. The
/// deadline is authoritative: a command racing it may classify as
/// time-limit-exceeded even if its exit was in flight.
fn poll_clone(clone_pid: Pid, time_limit_ms: u64) -> Result<(RunStatus, Option<i32>, Option<i32>)> {
    let deadline =
        Instant::now() + Duration::from_millis(time_limit_ms.saturating_add(OUTER_GRACE_MS));
    while Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
        match waitpid(clone_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                let status = RunStatus::from_monitor_exit(code);
                log::info!("monitor relayed exit {} -> {}", code, status);
                return Ok((status, Some(code), None));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                // The monitor never runs untrusted code, so a signal death
                // of the namespace init is never a normal outcome.
                log::warn!("namespace process killed by {}", signal);
                return Ok((RunStatus::SecurityViolation, None, Some(signal as i32)));
            }
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(e) => return Err(e.into()),
        }
    }

    log::info!("deadline exceeded, killing namespace process {}", clone_pid);
    let _ = kill(clone_pid, Signal::SIGKILL);
    let _ = waitpid(clone_pid, None);
    Ok((RunStatus::TimeLimitExceeded, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_arithmetic_tolerates_extreme_limits() {
        // No child to reap; the poll must fail cleanly instead of
        // overflowing while computing the deadline.
        let result = poll_clone(Pid::from_raw(-1), u64::MAX);
        assert!(result.is_err());
    }
}
