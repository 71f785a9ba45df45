//! Command-line surface: `new`, `run`, `del`.

use crate::types::ResourceLimits;
use crate::{mount, report, supervisor};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision a sandbox environment: read-only root plus writable scratch
    New {
        /// Prepared root filesystem image, bind-mounted read-only
        rootfs: PathBuf,
        /// Scratch filesystem size in megabytes
        scratch_mb: u64,
        /// Directory the environment is provisioned at
        target: PathBuf,
    },
    /// Execute one command inside a provisioned environment
    Run {
        /// Provisioned environment root
        target: PathBuf,
        /// Control root the per-run resource scope is created under
        scope_root: PathBuf,
        /// Wall-clock time limit in milliseconds
        time_limit_ms: u64,
        /// Memory ceiling in megabytes
        memory_limit_mb: u64,
        /// Process-count ceiling
        pid_limit: u32,
        /// Standard input file, resolved inside the sandbox
        stdin: PathBuf,
        /// Standard output file, resolved inside the sandbox
        stdout: PathBuf,
        /// Standard error file, resolved inside the sandbox
        stderr: PathBuf,
        /// Command path and arguments, resolved inside the sandbox
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
        /// Clone stack size in megabytes
        #[arg(long, default_value_t = 1)]
        stack_mb: u64,
        /// Use the legacy cgroup v1 hierarchy even when v2 is mounted
        #[arg(long)]
        cgroup_v1: bool,
        /// Also write the report to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Emit the report as JSON instead of the line format
        #[arg(long)]
        json: bool,
    },
    /// Destroy a provisioned environment
    Del {
        /// Environment root to tear down
        target: PathBuf,
    },
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    if !nix::unistd::getuid().is_root() {
        log::warn!("not running as root; namespace and cgroup setup will likely fail");
    }

    match cli.command {
        Commands::New {
            rootfs,
            scratch_mb,
            target,
        } => {
            mount::provision(&rootfs, scratch_mb, &target)?;
            Ok(())
        }
        Commands::Run {
            target,
            scope_root,
            time_limit_ms,
            memory_limit_mb,
            pid_limit,
            stdin,
            stdout,
            stderr,
            command,
            stack_mb,
            cgroup_v1,
            report: report_path,
            json,
        } => {
            let limits = run_limits(time_limit_ms, memory_limit_mb, pid_limit, stack_mb);
            let request = supervisor::RunRequest {
                target,
                scope_root,
                limits,
                stdin_path: stdin,
                stdout_path: stdout,
                stderr_path: stderr,
                command,
                force_cgroup_v1: cgroup_v1,
            };
            // Any classified outcome exits zero; a nonzero exit means
            // supervision itself failed before a report existed.
            let report = supervisor::run(&request)?;
            report::emit(&report, report_path.as_deref(), json)?;
            Ok(())
        }
        Commands::Del { target } => {
            mount::destroy(&target)?;
            Ok(())
        }
    }
}

/// Megabyte conversions saturate; an absurd operator value degrades to
/// the largest representable limit instead of wrapping.
fn run_limits(
    time_limit_ms: u64,
    memory_limit_mb: u64,
    pid_limit: u32,
    stack_mb: u64,
) -> ResourceLimits {
    ResourceLimits {
        time_limit_ms,
        memory_limit_bytes: memory_limit_mb.saturating_mul(MIB),
        pid_limit,
        stack_limit_bytes: stack_mb.saturating_mul(MIB) as usize,
    }
}
