//! Host-interrupt handling for an active run.
//!
//! SIGINT/SIGTERM may arrive with the program suspended anywhere, so the
//! handler works off a process-wide record: fixed-size, pre-encoded
//! directory buffers written before the handlers are installed, plus an
//! atomic kill target registered once the clone exists. The handler
//! restricts itself to async-signal-safe calls: kill, write, rmdir,
//! _exit. One run is active per invocation, so the record is never
//! written concurrently.

use crate::types::{Result, SandboxError};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

/// Worst case is the legacy hierarchy's four controller directories.
const MAX_SCOPE_DIRS: usize = 4;
const SCOPE_DIR_BUF: usize = 256;

struct ActiveRun {
    /// Clone pid to kill, 0 while no run is active
    pid: AtomicI32,
    dir_count: AtomicUsize,
    /// NUL-terminated scope directory paths for rmdir from the handler
    dirs: UnsafeCell<[[u8; SCOPE_DIR_BUF]; MAX_SCOPE_DIRS]>,
}

// Written only by the single main thread before the handlers go in; the
// handler reads it with the main thread suspended.
unsafe impl Sync for ActiveRun {}

static ACTIVE_RUN: ActiveRun = ActiveRun {
    pid: AtomicI32::new(0),
    dir_count: AtomicUsize::new(0),
    dirs: UnsafeCell::new([[0; SCOPE_DIR_BUF]; MAX_SCOPE_DIRS]),
};

/// Record the scope directories and install the SIGINT/SIGTERM handlers.
/// Armed as soon as the scope exists, before any sandboxed process does,
/// so an interrupt at any point of setup can still remove the control
/// directories. The kill target joins the record via [`register_pid`].
pub fn arm(control_dirs: &[PathBuf]) -> Result<()> {
    if control_dirs.len() > MAX_SCOPE_DIRS {
        return Err(SandboxError::Config(format!(
            "too many scope directories for the interrupt record: {}",
            control_dirs.len()
        )));
    }
    let buffers = ACTIVE_RUN.dirs.get();
    for (i, dir) in control_dirs.iter().enumerate() {
        let path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| SandboxError::Config("scope path contains NUL byte".to_string()))?;
        let bytes = path.as_bytes_with_nul();
        if bytes.len() > SCOPE_DIR_BUF {
            return Err(SandboxError::Config(format!(
                "scope path too long for the interrupt record: {}",
                dir.display()
            )));
        }
        // Buffers become visible to the handler only once dir_count is
        // published below.
        unsafe {
            (&mut (*buffers)[i])[..bytes.len()].copy_from_slice(bytes);
        }
    }
    ACTIVE_RUN.pid.store(0, Ordering::SeqCst);
    ACTIVE_RUN.dir_count.store(control_dirs.len(), Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(handle_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Publish the clone as the interrupt kill target. Must happen before the
/// start gate is released so an interrupt can never find a running
/// command without one.
pub fn register_pid(clone_pid: Pid) {
    ACTIVE_RUN.pid.store(clone_pid.as_raw(), Ordering::SeqCst);
}

/// Clear the record once the scope is gone. A signal landing after this
/// still reports `interrupted` but no longer kills or removes anything.
pub fn disarm() {
    ACTIVE_RUN.pid.store(0, Ordering::SeqCst);
    ACTIVE_RUN.dir_count.store(0, Ordering::SeqCst);
}

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    let pid = ACTIVE_RUN.pid.load(Ordering::SeqCst);
    if pid > 0 {
        // Killing the namespace's first process tears down the whole
        // PID namespace with it.
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
    let message = b"interrupted\n";
    unsafe {
        libc::write(
            libc::STDOUT_FILENO,
            message.as_ptr() as *const libc::c_void,
            message.len(),
        );
    }
    let count = ACTIVE_RUN.dir_count.load(Ordering::SeqCst).min(MAX_SCOPE_DIRS);
    let dirs = ACTIVE_RUN.dirs.get();
    for i in 0..count {
        // Best effort: the kill above may not have reaped yet, in which
        // case the kernel refuses and the scope leaks until the operator
        // retries.
        unsafe {
            libc::rmdir((*dirs)[i].as_ptr() as *const libc::c_char);
        }
    }
    unsafe { libc::_exit(1) }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Success-path arming installs real signal handlers, which belongs in
    // integration runs; here only the record validation is exercised.

    #[test]
    fn arm_rejects_too_many_dirs() {
        let dirs: Vec<PathBuf> = (0..MAX_SCOPE_DIRS + 1)
            .map(|i| PathBuf::from(format!("/sys/fs/cgroup/extra{}", i)))
            .collect();
        let result = arm(&dirs);
        assert!(matches!(result, Err(SandboxError::Config(_))));
    }

    #[test]
    fn arm_rejects_over_long_path() {
        let long = PathBuf::from(format!("/sys/fs/cgroup/{}", "x".repeat(SCOPE_DIR_BUF)));
        let result = arm(&[long]);
        assert!(matches!(result, Err(SandboxError::Config(_))));
    }
}
