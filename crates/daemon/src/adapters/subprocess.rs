// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subprocess execution with timeouts.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Ceiling for filesystem driver commands (mkdir, cp, btrfs). Cloning a
/// large build tree can legitimately take minutes on a plain filesystem.
pub const DRIVER_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("{what}: empty argv")]
    EmptyArgv { what: &'static str },
    #[error("{what}: could not spawn: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{what}: timed out after {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },
    #[error("{what}: {status}: {output}")]
    Failed {
        what: &'static str,
        status: std::process::ExitStatus,
        output: String,
    },
}

/// Run `argv` to completion, capturing combined stdout and stderr.
///
/// Returns the captured output on success so callers can log it. The
/// process is killed if it outlives `timeout`.
pub async fn run_argv(
    argv: &[String],
    timeout: Duration,
    what: &'static str,
) -> Result<String, SubprocessError> {
    let (program, args) = argv.split_first().ok_or(SubprocessError::EmptyArgv { what })?;

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => return Err(SubprocessError::Spawn { what, source }),
        Err(_) => return Err(SubprocessError::Timeout { what, timeout }),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let text = text.trim().to_string();

    if !output.status.success() {
        return Err(SubprocessError::Failed { what, status: output.status, output: text });
    }
    Ok(text)
}

#[cfg(test)]
#[path = "subprocess_tests.rs"]
mod tests;
