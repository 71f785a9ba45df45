//! Resource scope governance over cgroups.
//!
//! One run owns exactly one scope: a uniquely named control directory (or
//! directory set, on the legacy hierarchy) carrying the CPU, memory, and
//! process-count ceilings and the post-mortem accounting. Two generations are
//! supported behind one trait, selected once at startup: the unified v2
//! hierarchy and the legacy v1 multi-controller hierarchy.

pub mod v1;
pub mod v2;

use crate::types::{ResourceLimits, Result, SandboxError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub use v1::ScopeV1;
pub use v2::ScopeV2;

/// Scope directory name prefix under the control root.
pub(crate) const SCOPE_PREFIX: &str = "sealbox.";

const MAX_ID_ATTEMPTS: u32 = 16;

/// CPU quota: one full core (quota equal to the fixed 100ms period).
/// Wall-clock limiting is the supervisor's job, not the scheduler's.
pub(crate) const CPU_PERIOD_USEC: u64 = 100_000;
pub(crate) const CPU_QUOTA_USEC: u64 = 100_000;

/// Post-mortem accounting read back from a scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScopeUsage {
    /// Accumulated CPU time in milliseconds
    pub cpu_time_ms: u64,
    /// Peak memory in bytes
    pub peak_memory_bytes: u64,
}

/// Which cgroup hierarchy generation a scope lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeGeneration {
    V1,
    V2,
}

impl ScopeGeneration {
    pub fn name(&self) -> &'static str {
        match self {
            ScopeGeneration::V1 => "cgroup_v1",
            ScopeGeneration::V2 => "cgroup_v2",
        }
    }
}

/// One run's resource scope. Created with its limits already applied;
/// destroyed after usage read-back, on every exit path.
pub trait ResourceScope {
    /// Unique scope id (the random suffix of the control directory name)
    fn id(&self) -> &str;
    fn generation(&self) -> ScopeGeneration;
    /// Attach a process (and, transitively, its whole future subtree) to the
    /// scope. Must happen before the attached process forks, otherwise the
    /// grandchildren escape accounting.
    fn attach(&self, pid: i32) -> Result<()>;
    /// Read accumulated CPU time and peak memory. Meaningful only after the
    /// supervised tree has fully exited; missing accounting files degrade to
    /// zero rather than failing the report.
    fn read_usage(&self) -> ScopeUsage;
    /// Remove the scope's control directories. Safe to call on an already
    /// removed scope.
    fn destroy(&self) -> Result<()>;
    /// Control directories owned by the scope, for the interrupt path.
    fn control_dirs(&self) -> Vec<PathBuf>;
}

/// Detect the hierarchy generation mounted at `control_root`: v2 when the
/// root carries `cgroup.controllers`, v1 when the per-controller directories
/// are present.
pub fn detect_generation(control_root: &Path) -> Option<ScopeGeneration> {
    if control_root.join("cgroup.controllers").exists() {
        return Some(ScopeGeneration::V2);
    }
    if control_root.join("memory").is_dir() && control_root.join("cpu").is_dir() {
        return Some(ScopeGeneration::V1);
    }
    None
}

/// Create a scope under `control_root` with `limits` applied: v2 by default,
/// v1 as fallback, `force_v1` selects the legacy generation outright.
pub fn create_scope(
    control_root: &Path,
    limits: &ResourceLimits,
    force_v1: bool,
) -> Result<Box<dyn ResourceScope>> {
    if force_v1 {
        if control_root.join("memory").is_dir() && control_root.join("cpu").is_dir() {
            log::info!("using cgroup_v1 scope (explicit override)");
            return Ok(Box::new(ScopeV1::create(control_root, limits)?));
        }
        return Err(SandboxError::Cgroup(format!(
            "cgroup v1 forced but no v1 controllers mounted at {}",
            control_root.display()
        )));
    }

    match detect_generation(control_root) {
        Some(ScopeGeneration::V2) => {
            log::info!("using cgroup_v2 scope (default)");
            Ok(Box::new(ScopeV2::create(control_root, limits)?))
        }
        Some(ScopeGeneration::V1) => {
            log::info!("using cgroup_v1 scope (v2 not available)");
            Ok(Box::new(ScopeV1::create(control_root, limits)?))
        }
        None => Err(SandboxError::Cgroup(format!(
            "no cgroup hierarchy at {}",
            control_root.display()
        ))),
    }
}

/// Create a collision-free scope directory under `parent`, retrying with a
/// fresh id on collision so concurrent runs never share a scope.
pub(crate) fn create_unique_dir(parent: &Path) -> Result<(String, PathBuf)> {
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = short_id();
        let dir = parent.join(format!("{}{}", SCOPE_PREFIX, id));
        match fs::create_dir(&dir) {
            Ok(()) => return Ok((id, dir)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(SandboxError::Cgroup(format!(
                    "failed to create scope directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        }
    }
    Err(SandboxError::Cgroup(format!(
        "could not allocate a free scope id under {}",
        parent.display()
    )))
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Write one control-file value, mapping the failure onto the cgroup error.
pub(crate) fn write_control(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(|e| {
        SandboxError::Cgroup(format!(
            "failed to write '{}' to {}: {}",
            value,
            path.display(),
            e
        ))
    })
}

/// Read one counter from a flat keyed accounting file.
///
/// Grammar: one record per line, `key SP value NEWLINE` (the `cpu.stat` /
/// `memory.events` format). Returns `None` when the file, the key, or a
/// parseable value is absent.
pub(crate) fn read_keyed_counter(path: &Path, key: &str) -> Option<u64> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(k), Some(v)) if k == key => return v.parse().ok(),
            _ => {}
        }
    }
    None
}

/// Read a single-value counter file (`memory.peak`, `cpuacct.usage`).
pub(crate) fn read_counter(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn keyed_counter_finds_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu.stat");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "usage_usec 123456").unwrap();
        writeln!(f, "user_usec 100000").unwrap();
        writeln!(f, "system_usec 23456").unwrap();
        drop(f);

        assert_eq!(read_keyed_counter(&path, "usage_usec"), Some(123456));
        assert_eq!(read_keyed_counter(&path, "system_usec"), Some(23456));
    }

    #[test]
    fn keyed_counter_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.events");
        fs::write(&path, "low 0\nhigh 4\n").unwrap();

        assert_eq!(read_keyed_counter(&path, "oom_kill"), None);
    }

    #[test]
    fn keyed_counter_tolerates_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        fs::write(&path, "lonely\nusage_usec notanumber\nusage_usec 77\n").unwrap();

        // First matching record wins; a malformed value is a miss, not a panic.
        assert_eq!(read_keyed_counter(&path, "usage_usec"), None);
        assert_eq!(read_keyed_counter(&path, "lonely"), None);
    }

    #[test]
    fn keyed_counter_missing_file_is_none() {
        assert_eq!(
            read_keyed_counter(Path::new("/nonexistent/cpu.stat"), "usage_usec"),
            None
        );
    }

    #[test]
    fn counter_reads_trimmed_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.peak");
        fs::write(&path, "8388608\n").unwrap();

        assert_eq!(read_counter(&path), Some(8388608));
        assert_eq!(read_counter(&dir.path().join("absent")), None);
    }

    #[test]
    fn unique_dirs_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let (id_a, dir_a) = create_unique_dir(dir.path()).unwrap();
        let (id_b, dir_b) = create_unique_dir(dir.path()).unwrap();

        assert_ne!(id_a, id_b);
        assert_ne!(dir_a, dir_b);
        assert!(dir_a.is_dir());
        assert!(dir_b.is_dir());
        assert!(dir_a
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(SCOPE_PREFIX));
    }

    #[test]
    fn detection_on_arbitrary_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_generation(dir.path()), None);
    }

    #[test]
    fn detection_recognizes_v2_marker() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory pids\n").unwrap();
        assert_eq!(detect_generation(dir.path()), Some(ScopeGeneration::V2));
    }

    #[test]
    fn detection_recognizes_v1_controller_dirs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("memory")).unwrap();
        fs::create_dir(dir.path().join("cpu")).unwrap();
        assert_eq!(detect_generation(dir.path()), Some(ScopeGeneration::V1));
    }

    #[test]
    fn generation_names() {
        assert_eq!(ScopeGeneration::V1.name(), "cgroup_v1");
        assert_eq!(ScopeGeneration::V2.name(), "cgroup_v2");
    }
}
