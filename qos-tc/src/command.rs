//! Runs `tc` and captures what it printed.

use std::{io, process};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn: {0}")]
    Io(#[from] io::Error),
    #[error("exited with {}: {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
}

/// What a finished command wrote, decoded lossily.
#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&value.stderr).into_owned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
pub struct Runner;

impl Runner {
    /// Runs a prepared command to completion with stdin closed. A non-zero exit is an error
    /// carrying the captured output.
    pub fn run(mut cmd: process::Command) -> Result<Output> {
        cmd.stdin(process::Stdio::null())
            .stderr(process::Stdio::piped())
            .stdout(process::Stdio::piped());

        tracing::trace!(?cmd, "running command");
        let output = Output::from(cmd.output()?);

        if !output.status.success() {
            tracing::debug!(stderr = %output.stderr.trim(), status = %output.status, ?cmd, "command failed");
            return Err(Error::NonZero(output));
        }
        Ok(output)
    }
}
