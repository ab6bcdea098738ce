//! Thin wrapper for the external tools the adapters shell out to.

use std::io::ErrorKind as IoErrorKind;
use std::process::{Command, Output, Stdio};

use tracing::debug;

use crate::error::{ErrorKind, StageError, StageResult};

/// Run `program` to completion with piped stdio.
///
/// A missing binary maps to `missing`; a non-zero exit maps to `failed`
/// with the tail of stderr as the message.
pub fn run_tool(
    program: &str,
    args: &[String],
    missing: ErrorKind,
    failed: ErrorKind,
) -> StageResult<Output> {
    debug!(program, args = %args.join(" "), "spawning external tool");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| match e.kind() {
            IoErrorKind::NotFound => StageError::new(missing, format!("{program} not found on PATH")),
            _ => StageError::new(missing, format!("failed to spawn {program}: {e}")),
        })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(StageError::new(
            failed,
            format!(
                "{program} exited with {}: {}",
                output.status,
                stderr_tail(&output.stderr)
            ),
        ))
    }
}

/// Last few lines of a tool's stderr, for error messages.
pub fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(3);
    lines[start..].join(" | ")
}
