//! Asynchronous utilities for use with Tokio.
//!
//! Everything slow in this program is either an external command (poppler,
//! tesseract), CPU-bound image or PDF work, or a network call. The first two
//! are wrapped here so the rest of the code can just `.await` them.

use std::{process::Output, sync::LazyLock};

use regex::Regex;
use tokio::process::Command;

use crate::prelude::*;

/// Lines in command output that indicate failure.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler complains about these while successfully repairing a file.
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of poppler output report an error?
pub fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Run a command to completion, capturing its output, and fail if it exits
/// unsuccessfully or prints an error line.
pub async fn run_command(
    command_name: &str,
    cmd: &mut Command,
    error_line: Option<&(dyn Fn(&str) -> bool + Sync)>,
) -> Result<Output> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("cannot run {command_name}"))?;
    check_for_command_failure(command_name, &output, error_line)?;
    Ok(output)
}

/// Report any command failures, and include any error output.
///
/// The output of standard error and standard output will be logged at
/// appropriate levels. And standard error may be optionally checked line by
/// line to determine if the command failed.
pub fn check_for_command_failure(
    command_name: &str,
    output: &Output,
    error_line: Option<&(dyn Fn(&str) -> bool + Sync)>,
) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        bytes = output.stdout.len(),
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        debug!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        match error_line {
            Some(error_line) if stderr.lines().any(error_line) => Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            )),
            _ => Ok(()),
        }
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_error_line_works() {
        assert!(is_error_line("error: something went wrong"));
        assert!(is_error_line("Syntax Error: Invalid page count 0"));
        assert!(!is_error_line("Warning: something is odd"));
        assert!(!is_error_line(
            "Internal Error: xref num 1234 not found but needed, document has changes, reconstruct aborted"
        ));
    }

    #[tokio::test]
    async fn run_command_reports_missing_binaries() {
        let mut cmd = Command::new("definitely-not-a-real-command-7d1f");
        let err = run_command("definitely-not-a-real-command-7d1f", &mut cmd, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot run"));
    }

    #[tokio::test]
    async fn spawn_blocking_returns_value() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }
}
