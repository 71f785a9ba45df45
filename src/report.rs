//! Report rendering and emission.
//!
//! The artifact is deliberately trivial to parse from the calling side:
//! first line is the status keyword, every following line a `key value`
//! pair. `exit` and `signal` appear only when the run produced one.

use crate::types::{ExecutionReport, Result};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Render the line-oriented report artifact.
pub fn render(report: &ExecutionReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", report.status.keyword());
    if let Some(code) = report.exit_code {
        let _ = writeln!(out, "exit {}", code);
    }
    if let Some(signal) = report.signal {
        let _ = writeln!(out, "signal {}", signal);
    }
    let _ = writeln!(out, "memory {}", report.peak_memory_bytes);
    let _ = writeln!(out, "cpu {}", report.cpu_time_ms);
    out
}

/// Print the report to stdout and, when a path is given, persist the same
/// artifact there.
pub fn emit(report: &ExecutionReport, report_path: Option<&Path>, json: bool) -> Result<()> {
    let artifact = if json {
        let mut body = serde_json::to_string_pretty(report).map_err(std::io::Error::from)?;
        body.push('\n');
        body
    } else {
        render(report)
    };
    print!("{}", artifact);
    if let Some(path) = report_path {
        fs::write(path, &artifact)?;
    }
    Ok(())
}
