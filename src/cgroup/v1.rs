//! Legacy split-hierarchy (cgroup v1) scope.
//!
//! Each controller is its own mount, so one scope owns a same-named
//! directory under every controller it needs and every operation fans out
//! across them.

use crate::cgroup::{
    create_unique_dir, read_counter, write_control, ResourceScope, ScopeGeneration, ScopeUsage,
    CPU_PERIOD_USEC, CPU_QUOTA_USEC, SCOPE_PREFIX,
};
use crate::types::{ResourceLimits, Result, SandboxError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const CONTROLLERS: [&str; 4] = ["cpu", "cpuacct", "memory", "pids"];

pub struct ScopeV1 {
    id: String,
    name: String,
    root: PathBuf,
}

impl ScopeV1 {
    pub fn create(control_root: &Path, limits: &ResourceLimits) -> Result<Self> {
        // The cpu controller allocates the unique name; the other
        // controllers reuse it.
        let (id, _) = create_unique_dir(&control_root.join("cpu"))?;
        let scope = ScopeV1 {
            name: format!("{}{}", SCOPE_PREFIX, id),
            id,
            root: control_root.to_path_buf(),
        };
        for controller in &CONTROLLERS[1..] {
            // cpu and cpuacct are commonly co-mounted, in which case the cpu
            // step already created this directory.
            if let Err(e) = fs::create_dir(scope.dir(controller)) {
                if e.kind() != ErrorKind::AlreadyExists {
                    let _ = scope.destroy();
                    return Err(SandboxError::Cgroup(format!(
                        "failed to create {} scope directory: {}",
                        controller, e
                    )));
                }
            }
        }
        if let Err(e) = scope.apply_limits(limits) {
            let _ = scope.destroy();
            return Err(e);
        }
        log::debug!("created cgroup_v1 scope {} under {}", scope.id, control_root.display());
        Ok(scope)
    }

    fn dir(&self, controller: &str) -> PathBuf {
        self.root.join(controller).join(&self.name)
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        let cpu = self.dir("cpu");
        write_control(&cpu.join("cpu.cfs_period_us"), &CPU_PERIOD_USEC.to_string())?;
        write_control(&cpu.join("cpu.cfs_quota_us"), &CPU_QUOTA_USEC.to_string())?;

        let memory = self.dir("memory");
        let bytes = limits.memory_limit_bytes.to_string();
        write_control(&memory.join("memory.limit_in_bytes"), &bytes)?;
        // memsw accounting needs swapaccount=1 on the kernel command line;
        // skip it where the kernel never exposed the file.
        let memsw = memory.join("memory.memsw.limit_in_bytes");
        if memsw.exists() {
            write_control(&memsw, &bytes)?;
        }

        write_control(
            &self.dir("pids").join("pids.max"),
            &limits.pid_limit.to_string(),
        )?;
        Ok(())
    }
}

impl ResourceScope for ScopeV1 {
    fn id(&self) -> &str {
        &self.id
    }

    fn generation(&self) -> ScopeGeneration {
        ScopeGeneration::V1
    }

    fn attach(&self, pid: i32) -> Result<()> {
        for controller in &CONTROLLERS {
            write_control(&self.dir(controller).join("tasks"), &pid.to_string())?;
        }
        Ok(())
    }

    fn read_usage(&self) -> ScopeUsage {
        let cpu_time_ms = read_counter(&self.dir("cpuacct").join("cpuacct.usage"))
            .map(|nsec| nsec / 1_000_000)
            .unwrap_or(0);
        let memory = self.dir("memory");
        let peak_memory_bytes = read_counter(&memory.join("memory.memsw.max_usage_in_bytes"))
            .or_else(|| read_counter(&memory.join("memory.max_usage_in_bytes")))
            .unwrap_or(0);
        ScopeUsage {
            cpu_time_ms,
            peak_memory_bytes,
        }
    }

    fn destroy(&self) -> Result<()> {
        let mut first_err = None;
        for controller in &CONTROLLERS {
            match fs::remove_dir(self.dir(controller)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(SandboxError::Cgroup(format!(
                            "failed to remove scope {}: {}",
                            self.dir(controller).display(),
                            e
                        )));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn control_dirs(&self) -> Vec<PathBuf> {
        CONTROLLERS.iter().map(|c| self.dir(c)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_v1_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for controller in &CONTROLLERS {
            fs::create_dir(root.path().join(controller)).unwrap();
        }
        root
    }

    fn clear_files(dir: &Path) {
        for entry in fs::read_dir(dir).unwrap() {
            fs::remove_file(entry.unwrap().path()).unwrap();
        }
    }

    #[test]
    fn create_applies_limits_across_controllers() {
        let root = fake_v1_root();
        let limits = ResourceLimits::default();
        let scope = ScopeV1::create(root.path(), &limits).unwrap();

        let dirs = scope.control_dirs();
        assert_eq!(dirs.len(), 4);
        for dir in &dirs {
            assert!(dir.is_dir(), "missing controller dir {}", dir.display());
        }

        let cpu = &dirs[0];
        assert_eq!(
            fs::read_to_string(cpu.join("cpu.cfs_period_us")).unwrap(),
            "100000"
        );
        assert_eq!(
            fs::read_to_string(cpu.join("cpu.cfs_quota_us")).unwrap(),
            "100000"
        );
        let memory = &dirs[2];
        assert_eq!(
            fs::read_to_string(memory.join("memory.limit_in_bytes")).unwrap(),
            limits.memory_limit_bytes.to_string()
        );
        // No memsw file pre-existing means the swap ceiling is skipped.
        assert!(!memory.join("memory.memsw.limit_in_bytes").exists());
        let pids = &dirs[3];
        assert_eq!(fs::read_to_string(pids.join("pids.max")).unwrap(), "16");
        assert_eq!(scope.generation(), ScopeGeneration::V1);
    }

    #[test]
    fn attach_writes_to_every_tasks_file() {
        let root = fake_v1_root();
        let scope = ScopeV1::create(root.path(), &ResourceLimits::default()).unwrap();
        scope.attach(777).unwrap();

        for dir in scope.control_dirs() {
            assert_eq!(fs::read_to_string(dir.join("tasks")).unwrap(), "777");
        }
    }

    #[test]
    fn usage_converts_nanoseconds_and_prefers_memsw_peak() {
        let root = fake_v1_root();
        let scope = ScopeV1::create(root.path(), &ResourceLimits::default()).unwrap();
        let dirs = scope.control_dirs();

        fs::write(dirs[1].join("cpuacct.usage"), "2500000000\n").unwrap();
        fs::write(dirs[2].join("memory.memsw.max_usage_in_bytes"), "9000000\n").unwrap();
        fs::write(dirs[2].join("memory.max_usage_in_bytes"), "100\n").unwrap();

        let usage = scope.read_usage();
        assert_eq!(usage.cpu_time_ms, 2500);
        assert_eq!(usage.peak_memory_bytes, 9_000_000);
    }

    #[test]
    fn usage_falls_back_to_non_swap_peak() {
        let root = fake_v1_root();
        let scope = ScopeV1::create(root.path(), &ResourceLimits::default()).unwrap();
        let dirs = scope.control_dirs();

        fs::write(dirs[2].join("memory.max_usage_in_bytes"), "5242880\n").unwrap();

        assert_eq!(scope.read_usage().peak_memory_bytes, 5_242_880);
    }

    #[test]
    fn destroy_removes_all_controller_dirs() {
        let root = fake_v1_root();
        let scope = ScopeV1::create(root.path(), &ResourceLimits::default()).unwrap();

        // remove_dir needs the fake control files gone first.
        for dir in scope.control_dirs() {
            clear_files(&dir);
        }

        scope.destroy().unwrap();
        for dir in scope.control_dirs() {
            assert!(!dir.exists());
        }
        scope.destroy().unwrap();
    }
}
