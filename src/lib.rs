//! sealbox: a minimal judge-style execution sandbox.
//!
//! One invocation provisions, executes into, or destroys a single sandboxed
//! environment with kernel-enforced boundaries.
//!
//! # Architecture
//!
//! - [`mount`]: environment provisioning (read-only root bind, tmpfs scratch)
//! - [`cgroup`]: per-run resource scopes (unified v2, legacy v1 fallback)
//! - [`container`]: in-namespace side (root switch, monitor/worker pair)
//! - [`supervisor`]: outer supervision (clone, attach gate, deadline, classification)
//! - [`interrupt`]: async-signal-safe host interrupt handling
//! - [`report`]: report artifact rendering and emission
//! - [`cli`]: `new` / `run` / `del` command surface
//!
//! The process model is three deep. The supervisor stays in the host
//! namespaces and owns the resource scope. A five-namespace clone becomes
//! the sandbox's init and monitor; it never runs untrusted code. Its forked
//! worker sheds privileges and execs the command. The only channel back up
//! is a fixed exit-code protocol, decoded into a [`RunStatus`].

pub mod cgroup;
pub mod cli;
pub mod container;
pub mod interrupt;
pub mod mount;
pub mod report;
pub mod supervisor;
pub mod types;

pub use types::{ExecutionReport, ResourceLimits, Result, RunStatus, SandboxError};
