//! Helper for shelling out to the host's block-device tooling.
//!
//! `losetup`, `dmsetup`, and `mkfs.ext4` are invoked as external processes
//! rather than through FFI bindings, matching how the rest of this codebase
//! treats privileged OS operations.

use std::process::Stdio;

use tokio::process::Command;

use crate::{Error, Result};

/// Runs `program` with `args`, returning trimmed stdout on success.
///
/// A non-zero exit maps to [`Error::CommandFailed`] carrying stderr, so
/// callers see what the external tool actually complained about.
pub async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::CommandFailed(format!("spawn {program}: {e}")))?;

    if !output.status.success() {
        return Err(Error::CommandFailed(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

/// Like [`run`], but swallows failure — used for best-effort teardown steps
/// where a missing device or mapping is not an error.
pub async fn run_best_effort(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args).await {
        tracing::warn!(error = %e, program, ?args, "best-effort teardown command failed");
    }
}
