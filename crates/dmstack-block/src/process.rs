//! External process execution
//!
//! Commands are described by [`CommandSpec`] and run through a
//! [`ProcessRunner`] so that tests and dry runs can substitute their own.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::ProcessError;

/// A command line with optional stdin payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Value of a `key=value` style argument
    pub fn keyed_arg(&self, key: &str) -> Option<&str> {
        self.args.iter().find_map(|a| {
            a.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl ProcessOutput {
    /// A successful run with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// A failed run with the given stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            code: Some(code),
        }
    }
}

/// Runs commands to completion
pub trait ProcessRunner: Send + Sync + fmt::Debug {
    /// Run `command`, returning its output whether or not it succeeded
    fn run(&self, command: &CommandSpec) -> Result<ProcessOutput, ProcessError>;
}

/// Runs commands with [`std::process::Command`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        debug!(command = %command, "running");

        let spawn_err = |source| ProcessError::Spawn {
            program: command.program.clone(),
            source,
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(if command.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let (Some(input), Some(mut pipe)) = (&command.stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).map_err(spawn_err)?;
        }

        let output = child.wait_with_output().map_err(spawn_err)?;
        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Run `command` and turn a non-zero exit into an error
pub fn run_checked(
    runner: &dyn ProcessRunner,
    command: &CommandSpec,
) -> Result<ProcessOutput, ProcessError> {
    let output = runner.run(command)?;
    if output.success {
        Ok(output)
    } else {
        Err(ProcessError::Failed {
            command: command.to_string(),
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Zero the first `sectors` sectors of `path`
pub fn zero_fill(runner: &dyn ProcessRunner, path: &str, sectors: u64) -> Result<(), ProcessError> {
    let command = CommandSpec::new("dd").args([
        "if=/dev/zero".to_string(),
        format!("of={path}"),
        "oflag=direct".to_string(),
        "bs=512".to_string(),
        format!("count={sectors}"),
    ]);
    run_checked(runner, &command)?;
    debug!(path, sectors, "zeroed device header");
    Ok(())
}

/// Size of a block device in sectors
pub fn dev_size(runner: &dyn ProcessRunner, path: &str) -> Result<u64, ProcessError> {
    let command = CommandSpec::new("blockdev").args(["--getsz", path]);
    let output = run_checked(runner, &command)?;
    output
        .stdout
        .trim()
        .parse()
        .map_err(|_| ProcessError::BadOutput {
            command: command.to_string(),
            output: output.stdout.trim().to_string(),
        })
}
