//! Utilities for [`std::process::Command`].

use std::{
    io,
    os::unix::process::ExitStatusExt as _,
    process::{self, Stdio},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("non-zero exit status ({}): {}", .0.status, .0.stderr.trim())]
    NonZero(Output),
}

/// The captured result of a finished command.
#[derive(Debug, Clone)]
pub struct Output {
    pub status: process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// A successful output carrying the given stdout.
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: process::ExitStatus::from_raw(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: process::ExitStatus::from_raw((code & 0xff) << 8),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<process::Output> for Output {
    fn from(value: process::Output) -> Self {
        Self {
            status: value.status,
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Render a command as the string a shell user would type.
pub fn render(cmd: &process::Command) -> String {
    let mut cmd_str = cmd.get_program().to_string_lossy().to_string();
    for arg in cmd.get_args() {
        cmd_str.push(' ');
        cmd_str.push_str(&arg.to_string_lossy());
    }

    cmd_str
}

#[derive(Debug)]
pub struct Runner;

impl Runner {
    /// Runs the given argv, the first element being the program.
    pub fn by_args<S: AsRef<str>>(argv: &[S]) -> Result<Output> {
        let (program, args) = argv.split_first().ok_or(Error::Empty)?;
        let mut cmd = process::Command::new(program.as_ref());
        cmd.args(args.iter().map(AsRef::as_ref));

        Self::run(&mut cmd)
    }

    /// Runs the command to completion, capturing both output streams. A non-zero exit status is
    /// returned as [`Error::NonZero`] with the captured output.
    pub fn run(cmd: &mut process::Command) -> Result<Output> {
        cmd.stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());

        tracing::debug!(cmd = %render(cmd), "running command");

        let output: Output = cmd.spawn()?.wait_with_output()?.into();

        if !output.status.success() {
            tracing::debug!(
                ?output.stderr,
                ?output.status,
                cmd = %render(cmd),
                "command returned non-zero status"
            );
            return Err(Error::NonZero(output));
        }

        Ok(output)
    }
}
