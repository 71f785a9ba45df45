//! In-namespace side of a run.
//!
//! The cloned process owns three jobs, in order: wait on the start gate
//! until the supervisor has attached it to the resource scope, seal the
//! namespace around the provisioned root, then split into a monitor/worker
//! pair. The monitor is the namespace's init: it never runs untrusted code
//! and relays the worker's fate to the outer supervisor through a fixed
//! exit-code protocol. The worker sheds everything it inherited and execs
//! the untrusted command.

use crate::types::{
    Result, SandboxError, MONITOR_EXIT_OK, MONITOR_EXIT_RUNTIME_ERROR, MONITOR_EXIT_SIGNALED,
    MONITOR_EXIT_TIME_LIMIT,
};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, close, dup2, execve, fork, pivot_root, read, sethostname, setgroups};
use nix::unistd::{ForkResult, Pid};
use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

const SANDBOX_HOSTNAME: &str = "sandbox";

/// Fixed unprivileged identity for the untrusted command (nobody/nogroup).
const SANDBOX_UID: libc::uid_t = 65534;
const SANDBOX_GID: libc::gid_t = 65534;

/// Soft allowance the in-namespace monitor adds on top of the time limit.
/// The outer supervisor's harder deadline is authoritative; this one just
/// lets a clean exit win the race most of the time.
const INNER_GRACE_MS: u64 = 500;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code for plumbing failures inside the namespace. Deliberately
/// outside the monitor protocol so the supervisor reports unknown-error
/// instead of misattributing the failure to the command.
const EXIT_SETUP_FAILURE: i32 = 64;

/// Worker exit code when setup or the exec itself failed.
const EXIT_EXEC_FAILURE: i32 = 127;

/// Everything the cloned process needs, captured before the clone so the
/// child never touches supervisor state.
pub struct ContainerRequest {
    /// Provisioned sandbox root on the host side
    pub target: PathBuf,
    /// Worker stdio, resolved inside the namespace after the root switch
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Command path plus arguments, non-empty
    pub command: Vec<String>,
    pub time_limit_ms: u64,
}

/// Entry point of the cloned namespace process. The return value becomes
/// the process exit status the outer supervisor decodes.
pub fn container_main(request: &ContainerRequest, gate_read: RawFd, gate_write: RawFd) -> isize {
    match run_container(request, gate_read, gate_write) {
        Ok(code) => code as isize,
        Err(e) => {
            log::error!("container setup failed: {}", e);
            EXIT_SETUP_FAILURE as isize
        }
    }
}

fn run_container(request: &ContainerRequest, gate_read: RawFd, gate_write: RawFd) -> Result<i32> {
    // Our copy of the write end must go first, or the read below would
    // wait on ourselves forever.
    let _ = close(gate_write);
    wait_for_start_gate(gate_read)?;
    let _ = close(gate_read);

    // Die with the supervisor rather than lingering half-isolated.
    prctl::set_pdeathsig(Signal::SIGKILL)?;

    enter_sealed_root(&request.target)?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(monitor_worker(child, request.time_limit_ms)),
        ForkResult::Child => run_worker(request),
    }
}

/// Block until the supervisor closes its end of the gate. EOF is the only
/// legal outcome: it means scope attachment finished, and this process may
/// now fork without anything escaping accounting.
fn wait_for_start_gate(gate_read: RawFd) -> Result<()> {
    let mut byte = [0u8; 1];
    let n = read(gate_read, &mut byte)?;
    if n != 0 {
        return Err(SandboxError::Process(
            "spurious byte on the start gate".to_string(),
        ));
    }
    Ok(())
}

/// Seal the namespace around the provisioned root. Strictly ordered; after
/// this returns the namespace cannot reach the host filesystem and /proc
/// reflects the new PID namespace. Every step carries its own context so a
/// setup failure names what refused, not just an errno.
fn enter_sealed_root(target: &Path) -> Result<()> {
    sethostname(SANDBOX_HOSTNAME)
        .map_err(|e| SandboxError::Namespace(format!("failed to set hostname: {}", e)))?;
    // Sever propagation before any mount below, or they leak into the
    // host mount namespace.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::Namespace(format!("failed to privatize the mount tree: {}", e))
    })?;
    chdir(target).map_err(|e| {
        SandboxError::Namespace(format!("failed to enter {}: {}", target.display(), e))
    })?;
    // Degenerate pivot: new root and old root are the same directory, so
    // no staging subdirectory is needed. The lazy detach makes the host
    // tree unreachable without waiting on open handles.
    pivot_root(".", ".")
        .map_err(|e| SandboxError::Namespace(format!("failed to pivot into the root: {}", e)))?;
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| SandboxError::Namespace(format!("failed to detach the old root: {}", e)))?;
    // Scratch area becomes the working directory for the worker.
    chdir("/tmp").map_err(|e| {
        SandboxError::Namespace(format!("failed to enter the scratch area: {}", e))
    })?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| SandboxError::Namespace(format!("failed to mount /proc: {}", e)))?;
    Ok(())
}

/// In-namespace monitor: poll the worker against the soft deadline and
/// translate its fate into the exit-code protocol.
fn monitor_worker(worker: Pid, time_limit_ms: u64) -> i32 {
    let deadline =
        Instant::now() + Duration::from_millis(time_limit_ms.saturating_add(INNER_GRACE_MS));
    while Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
        match waitpid(worker, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, 0)) => return MONITOR_EXIT_OK,
            Ok(WaitStatus::Exited(_, _)) => return MONITOR_EXIT_RUNTIME_ERROR,
            // Signal death means the limit machinery or the kernel killed
            // it, not an ordinary failing exit.
            Ok(WaitStatus::Signaled(..)) => return MONITOR_EXIT_SIGNALED,
            Ok(_) => {}
            Err(Errno::EINTR) => {}
            Err(_) => return EXIT_SETUP_FAILURE,
        }
    }
    MONITOR_EXIT_TIME_LIMIT
}

/// Worker: shed the inherited environment and exec the untrusted command.
/// Only ever returns into `process::exit`; the monitor turns the nonzero
/// exit into runtime-error.
fn run_worker(request: &ContainerRequest) -> ! {
    let _ = prepare_and_exec(request);
    process::exit(EXIT_EXEC_FAILURE)
}

fn prepare_and_exec(request: &ContainerRequest) -> Result<Infallible> {
    // fork cleared the parent-death signal, arm it again.
    prctl::set_pdeathsig(Signal::SIGKILL)?;
    redirect_stdio(request)?;
    lift_stack_limit()?;
    close_extra_fds();
    drop_credentials()?;
    exec_command(&request.command)
}

fn redirect_stdio(request: &ContainerRequest) -> Result<()> {
    let input = File::open(&request.stdin_path)?;
    let output = File::create(&request.stdout_path)?;
    let errors = File::create(&request.stderr_path)?;
    // into_raw_fd keeps the descriptors open past this scope; the close
    // pass below reclaims the originals once dup2 has pinned 0/1/2.
    dup2(input.into_raw_fd(), 0)?;
    dup2(output.into_raw_fd(), 1)?;
    dup2(errors.into_raw_fd(), 2)?;
    Ok(())
}

/// The clone stack was sized by the caller; the command gets the default
/// unlimited stack back.
fn lift_stack_limit() -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_STACK, &limit) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "failed to lift RLIMIT_STACK: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Close every descriptor above stderr so the command inherits nothing
/// privileged. close_range first (Linux 5.9+), /proc/self/fd iteration as
/// the fallback. Best effort: close hardly ever fails and a survivor is
/// not worth aborting the exec over.
fn close_extra_fds() {
    const CLOSE_RANGE_UNSHARE: libc::c_uint = 1 << 1;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_UNSHARE,
        )
    };
    if rc == 0 {
        return;
    }
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>() {
                if fd > 2 {
                    // EBADF here is the read_dir descriptor itself
                    let _ = close(fd);
                }
            }
        }
    }
}

/// Drop to the fixed unprivileged identity. setresgid must come before
/// setresuid: once the uid is gone, so is the privilege to change groups.
fn drop_credentials() -> Result<()> {
    setgroups(&[])?;
    let rc = unsafe { libc::setresgid(SANDBOX_GID, SANDBOX_GID, SANDBOX_GID) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "failed to setresgid({}): {}",
            SANDBOX_GID,
            std::io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::setresuid(SANDBOX_UID, SANDBOX_UID, SANDBOX_UID) };
    if rc != 0 {
        return Err(SandboxError::Process(format!(
            "failed to setresuid({}): {}",
            SANDBOX_UID,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// exec with an empty environment: the command sees nothing from the host.
fn exec_command(command: &[String]) -> Result<Infallible> {
    if command.is_empty() {
        return Err(SandboxError::Config("empty command".to_string()));
    }
    let mut cargv = Vec::with_capacity(command.len());
    for arg in command {
        let c = CString::new(arg.as_str())
            .map_err(|_| SandboxError::Config("command contains NUL byte".to_string()))?;
        cargv.push(c);
    }
    let cargv_ref: Vec<&CStr> = cargv.iter().map(|c| c.as_c_str()).collect();
    let empty_env: Vec<&CStr> = Vec::new();
    execve(cargv[0].as_c_str(), &cargv_ref, &empty_env)
        .map_err(|e| SandboxError::Process(format!("execve {} failed: {}", command[0], e)))
}
