//! Unified-hierarchy (cgroup v2) scope.

use crate::cgroup::{
    create_unique_dir, read_counter, read_keyed_counter, write_control, ResourceScope,
    ScopeGeneration, ScopeUsage, CPU_PERIOD_USEC, CPU_QUOTA_USEC,
};
use crate::types::{ResourceLimits, Result, SandboxError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// One scope directory under the unified hierarchy. All controllers live in
/// the same directory, so create, attach, and destroy are single-path
/// operations.
pub struct ScopeV2 {
    id: String,
    dir: PathBuf,
}

impl ScopeV2 {
    pub fn create(control_root: &Path, limits: &ResourceLimits) -> Result<Self> {
        let (id, dir) = create_unique_dir(control_root)?;
        let scope = ScopeV2 { id, dir };
        if let Err(e) = scope.apply_limits(limits) {
            let _ = fs::remove_dir(&scope.dir);
            return Err(e);
        }
        log::debug!(
            "created cgroup_v2 scope {} at {}",
            scope.id,
            scope.dir.display()
        );
        Ok(scope)
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        write_control(
            &self.dir.join("cpu.max"),
            &format!("{} {}", CPU_QUOTA_USEC, CPU_PERIOD_USEC),
        )?;
        // high throttles before max kills, so the kernel gets a chance to
        // reclaim ahead of the hard OOM boundary.
        write_control(
            &self.dir.join("memory.high"),
            &limits.memory_limit_bytes.to_string(),
        )?;
        write_control(
            &self.dir.join("memory.max"),
            &limits.memory_limit_bytes.to_string(),
        )?;
        write_control(&self.dir.join("pids.max"), &limits.pid_limit.to_string())?;
        Ok(())
    }
}

impl ResourceScope for ScopeV2 {
    fn id(&self) -> &str {
        &self.id
    }

    fn generation(&self) -> ScopeGeneration {
        ScopeGeneration::V2
    }

    fn attach(&self, pid: i32) -> Result<()> {
        write_control(&self.dir.join("cgroup.procs"), &pid.to_string())
    }

    fn read_usage(&self) -> ScopeUsage {
        // memory.peak is a recent addition; fall back to the instantaneous
        // counter on older kernels rather than reporting nothing.
        let peak_memory_bytes = read_counter(&self.dir.join("memory.peak"))
            .or_else(|| read_counter(&self.dir.join("memory.current")))
            .unwrap_or(0);
        let cpu_time_ms = read_keyed_counter(&self.dir.join("cpu.stat"), "usage_usec")
            .map(|usec| usec / 1000)
            .unwrap_or(0);
        ScopeUsage {
            cpu_time_ms,
            peak_memory_bytes,
        }
    }

    fn destroy(&self) -> Result<()> {
        match fs::remove_dir(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Cgroup(format!(
                "failed to remove scope {}: {}",
                self.dir.display(),
                e
            ))),
        }
    }

    fn control_dirs(&self) -> Vec<PathBuf> {
        vec![self.dir.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Control writes against a plain directory create regular files, which
    // is enough to verify the exact values without a real hierarchy.

    #[test]
    fn create_applies_all_limits() {
        let root = tempfile::tempdir().unwrap();
        let limits = ResourceLimits::default();
        let scope = ScopeV2::create(root.path(), &limits).unwrap();
        let dir = scope.control_dirs()[0].clone();

        assert_eq!(
            fs::read_to_string(dir.join("cpu.max")).unwrap(),
            "100000 100000"
        );
        assert_eq!(
            fs::read_to_string(dir.join("memory.high")).unwrap(),
            limits.memory_limit_bytes.to_string()
        );
        assert_eq!(
            fs::read_to_string(dir.join("memory.max")).unwrap(),
            limits.memory_limit_bytes.to_string()
        );
        assert_eq!(fs::read_to_string(dir.join("pids.max")).unwrap(), "16");
        assert_eq!(scope.generation(), ScopeGeneration::V2);
        assert_eq!(scope.id().len(), 8);
    }

    #[test]
    fn attach_writes_pid_to_procs() {
        let root = tempfile::tempdir().unwrap();
        let scope = ScopeV2::create(root.path(), &ResourceLimits::default()).unwrap();
        scope.attach(4242).unwrap();

        let dir = scope.control_dirs()[0].clone();
        assert_eq!(
            fs::read_to_string(dir.join("cgroup.procs")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn usage_prefers_peak_over_current() {
        let root = tempfile::tempdir().unwrap();
        let scope = ScopeV2::create(root.path(), &ResourceLimits::default()).unwrap();
        let dir = scope.control_dirs()[0].clone();

        fs::write(dir.join("memory.peak"), "8388608\n").unwrap();
        fs::write(dir.join("memory.current"), "1024\n").unwrap();
        fs::write(dir.join("cpu.stat"), "usage_usec 250000\nuser_usec 200000\n").unwrap();

        let usage = scope.read_usage();
        assert_eq!(usage.peak_memory_bytes, 8_388_608);
        assert_eq!(usage.cpu_time_ms, 250);
    }

    #[test]
    fn usage_falls_back_to_current_and_zero() {
        let root = tempfile::tempdir().unwrap();
        let scope = ScopeV2::create(root.path(), &ResourceLimits::default()).unwrap();
        let dir = scope.control_dirs()[0].clone();

        fs::write(dir.join("memory.current"), "4096\n").unwrap();

        let usage = scope.read_usage();
        assert_eq!(usage.peak_memory_bytes, 4096);
        assert_eq!(usage.cpu_time_ms, 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let scope = ScopeV2::create(root.path(), &ResourceLimits::default()).unwrap();
        let dir = scope.control_dirs()[0].clone();

        // remove_dir refuses a non-empty directory; clear the limit files
        // the fake hierarchy left behind.
        for entry in fs::read_dir(&dir).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }

        scope.destroy().unwrap();
        assert!(!dir.exists());
        scope.destroy().unwrap();
    }
}
