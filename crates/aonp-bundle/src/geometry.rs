//! Geometry script invocation
//!
//! The geometry of a study is produced by a user-supplied script. The
//! contract is argv-only, no shell: the script is executed directly with
//! the entry-point name and the output filename as arguments, receives the
//! canonical materials JSON on stdin, and must leave `geometry.xml` in its
//! working directory (the bundle's `inputs/`). The script is copied into
//! `inputs/` first so the bundle records exactly what ran.

use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;

use crate::BundleError;

/// Wall-clock cap for the geometry child process.
pub const GEOMETRY_SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Output filename the script must produce.
const GEOMETRY_OUTPUT: &str = "geometry.xml";

/// Bytes of stderr kept for error reporting.
const STDERR_TAIL_BYTES: usize = 2_048;

/// Copy the referenced script into `inputs/` and run it there.
///
/// # Errors
///
/// [`BundleError::GeometryScript`] when the script is missing, cannot be
/// spawned, exits non-zero, times out, or fails to produce
/// `geometry.xml`; [`BundleError::Io`] for copy failures.
pub fn run_geometry_script(
    script: &Utf8Path,
    entry: &str,
    inputs_dir: &Utf8Path,
    materials_json: &[u8],
) -> Result<(), BundleError> {
    if !script.is_file() {
        return Err(BundleError::GeometryScript {
            reason: format!("script not found: {script}"),
            stderr_tail: None,
        });
    }
    let file_name = script.file_name().ok_or_else(|| BundleError::GeometryScript {
        reason: format!("script path has no file name: {script}"),
        stderr_tail: None,
    })?;
    let staged = inputs_dir.join(file_name);
    fs::copy(script.as_std_path(), staged.as_std_path())
        .map_err(|source| BundleError::Io { path: staged.clone(), source })?;

    let mut child = Command::new(staged.as_std_path())
        .arg(entry)
        .arg(GEOMETRY_OUTPUT)
        .current_dir(inputs_dir.as_std_path())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BundleError::GeometryScript {
            reason: format!("failed to spawn {staged}: {e}"),
            stderr_tail: None,
        })?;

    // Feed the canonical materials object, then close stdin so scripts
    // that read to EOF do not hang.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(materials_json);
    }

    let (tx, rx) = mpsc::channel();
    let waiter = thread::spawn(move || {
        let _ = tx.send(child.wait_with_output());
    });

    let output = match rx.recv_timeout(GEOMETRY_SCRIPT_TIMEOUT) {
        Ok(result) => {
            let _ = waiter.join();
            result.map_err(|e| BundleError::GeometryScript {
                reason: format!("failed waiting for geometry script: {e}"),
                stderr_tail: None,
            })?
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // The child keeps the pipe open; leave the waiter thread to
            // reap it once the process dies on its own.
            return Err(BundleError::GeometryScript {
                reason: format!(
                    "geometry script exceeded {}s time limit",
                    GEOMETRY_SCRIPT_TIMEOUT.as_secs()
                ),
                stderr_tail: None,
            });
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            return Err(BundleError::GeometryScript {
                reason: "geometry script monitor thread died".to_string(),
                stderr_tail: None,
            });
        }
    };

    if !output.status.success() {
        return Err(BundleError::GeometryScript {
            reason: format!("geometry script exited with {}", output.status),
            stderr_tail: Some(stderr_tail(&output.stderr)),
        });
    }
    if !inputs_dir.join(GEOMETRY_OUTPUT).is_file() {
        return Err(BundleError::GeometryScript {
            reason: format!("geometry script produced no {GEOMETRY_OUTPUT}"),
            stderr_tail: Some(stderr_tail(&output.stderr)),
        });
    }
    Ok(())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let start = text.len().saturating_sub(STDERR_TAIL_BYTES);
    // Snap to a char boundary.
    let mut start = start;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(5000) + "LAST";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.len() <= STDERR_TAIL_BYTES + 4);
        assert!(tail.ends_with("LAST"));
    }

    #[test]
    fn test_stderr_tail_handles_multibyte() {
        let text = "é".repeat(3000);
        let tail = stderr_tail(text.as_bytes());
        assert!(tail.chars().all(|c| c == 'é'));
    }
}
