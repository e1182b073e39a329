//! Pre-flight checks for `tracepipe record`
//!
//! Only a bad output path is fatal. Missing privileges or a missing tracefs
//! are reported as warnings since recording continues without system
//! tracing.

#![allow(unsafe_code)] // geteuid() requires unsafe

use std::path::Path;

use anyhow::{bail, Result};

use crate::recorder::RecordConfig;
use crate::systrace::ftrace::{detect_root, TRACEFS_ROOTS};
use crate::systrace::Backend;

/// Run every check, printing warnings unless `quiet`.
///
/// # Errors
/// Fails when the output file cannot be created where it was asked for.
pub fn run_preflight_checks(config: &RecordConfig, quiet: bool) -> Result<()> {
    check_output_dir(&config.output)?;
    if quiet {
        return Ok(());
    }
    for warning in system_trace_warnings(config) {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

fn check_output_dir(output: &Path) -> Result<()> {
    if output.is_dir() {
        bail!(
            "Not a file: {}\n\n\
             --output must name a file, not a directory.",
            output.display()
        );
    }
    let parent = output.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    if !parent.is_dir() {
        bail!(
            "Output directory not found: {}\n\n\
             Create it first or pick another --output path.",
            parent.display()
        );
    }
    Ok(())
}

/// Reasons system tracing will probably not start for `config`.
#[must_use]
pub fn system_trace_warnings(config: &RecordConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    match config.backend {
        Backend::Ftrace => {
            if cfg!(not(target_os = "linux")) {
                warnings.push("ftrace is only available on Linux".to_string());
                return warnings;
            }
            if !is_root() {
                warnings.push(
                    "not running as root, tracefs is usually not writable (run with: sudo tracepipe record ...)"
                        .to_string(),
                );
            }
            let root = match &config.tracefs {
                Some(root) => root.join("tracing_on").exists().then(|| root.clone()),
                None => detect_root(TRACEFS_ROOTS.iter().map(Path::new)),
            };
            if root.is_none() {
                warnings.push("tracefs not found, mount it with: mount -t tracefs nodev /sys/kernel/tracing".to_string());
            }
        }
        Backend::Etw => {
            if cfg!(not(windows)) {
                warnings.push("ETW is only available on Windows".to_string());
            }
        }
    }
    warnings
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
