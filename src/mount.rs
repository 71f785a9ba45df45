//! Sandbox environment provisioning: a read-only root with a writable scratch.
//!
//! `provision` builds the mount stack for one environment, `destroy` tears it
//! down. Neither call touches namespaces; both run in the host mount
//! namespace and require privilege.

use crate::types::{Result, SandboxError};
use nix::mount::{mount, umount, MsFlags};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// A provisioned sandbox environment. Exclusively owned by its creator;
/// concurrent provisioning of the same target must be serialized by the
/// caller.
#[derive(Clone, Debug)]
pub struct SandboxEnv {
    /// Prepared root filesystem image the environment was built from
    pub rootfs: PathBuf,
    /// Mount point the environment lives at
    pub target: PathBuf,
    /// Scratch tmpfs size in megabytes
    pub scratch_mb: u64,
}

/// Render the tmpfs mount options for a scratch area of `scratch_mb` megabytes.
fn scratch_options(scratch_mb: u64) -> String {
    format!("mode=0777,size={}m", scratch_mb)
}

/// Provision an environment at `target` from the rootfs image at `rootfs`.
///
/// Steps, in order: create the target directory (already existing is fine),
/// bind-mount the rootfs over it, remount the bind read-only (a second mount
/// call because read-only cannot be requested together with the bind), mount
/// a world-writable size-bounded tmpfs at `<target>/tmp`. A failing step
/// aborts with the step's error; earlier mounts are left in place for the
/// caller to inspect or `destroy`.
pub fn provision(rootfs: &Path, scratch_mb: u64, target: &Path) -> Result<SandboxEnv> {
    match fs::create_dir(target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(SandboxError::Provision(format!(
                "failed to create {}: {}",
                target.display(),
                e
            )))
        }
    }

    mount(
        Some(rootfs),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::Provision(format!(
            "failed to bind {} onto {}: {}",
            rootfs.display(),
            target.display(),
            e
        ))
    })?;

    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        SandboxError::Provision(format!(
            "failed to remount {} read-only: {}",
            target.display(),
            e
        ))
    })?;

    let scratch = target.join("tmp");
    let data = scratch_options(scratch_mb);
    mount(
        Some("tmpfs"),
        &scratch,
        Some("tmpfs"),
        MsFlags::empty(),
        Some(data.as_str()),
    )
    .map_err(|e| {
        SandboxError::Provision(format!(
            "failed to mount scratch tmpfs at {}: {}",
            scratch.display(),
            e
        ))
    })?;

    log::info!(
        "provisioned environment at {} (rootfs {}, scratch {}M)",
        target.display(),
        rootfs.display(),
        scratch_mb
    );

    Ok(SandboxEnv {
        rootfs: rootfs.to_path_buf(),
        target: target.to_path_buf(),
        scratch_mb,
    })
}

/// Destroy the environment at `target`: unmount the scratch tmpfs, unmount
/// the root bind, remove the directory. Aborts at the first failing step so
/// the caller can retry; a second call on an already-destroyed target fails
/// cleanly at step one.
pub fn destroy(target: &Path) -> Result<()> {
    let scratch = target.join("tmp");
    umount(&scratch).map_err(|e| {
        SandboxError::Provision(format!("failed to unmount {}: {}", scratch.display(), e))
    })?;

    umount(target).map_err(|e| {
        SandboxError::Provision(format!("failed to unmount {}: {}", target.display(), e))
    })?;

    fs::remove_dir(target).map_err(|e| {
        SandboxError::Provision(format!("failed to remove {}: {}", target.display(), e))
    })?;

    log::info!("destroyed environment at {}", target.display());
    Ok(())
}
