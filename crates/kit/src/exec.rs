//! Execution of host commands
//!
//! Every external tool (rbd, qemu-img, virsh, the package manager) is
//! invoked through [`CommandRunner`] so the provisioning flow can be
//! exercised without a Ceph cluster or libvirt daemon.

use std::io;
use std::process::{Command, ExitStatus, Stdio};

use tracing::debug;

use crate::error::{ProvisionError, Result};

const REDACTED: &str = "<redacted>";

/// A single invocation of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Values that must never appear in logs or error messages.
    redact: Vec<String>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            redact: Vec::new(),
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

    /// Mask `value` wherever this command is displayed.
    pub fn redact(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.redact.push(value);
        }
        self
    }

    /// Shell-quoted rendering with sensitive values masked.
    pub fn display(&self) -> String {
        let words = std::iter::once(self.program.as_str()).chain(self.args.iter().map(|s| s.as_str()));
        let line = shlex::try_join(words).unwrap_or_else(|_| {
            std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        });
        self.mask(&line)
    }

    fn mask(&self, text: &str) -> String {
        self.redact
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Something that can execute a [`HostCommand`] and wait for it.
pub trait CommandRunner {
    fn run(&self, cmd: &HostCommand) -> io::Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &HostCommand) -> io::Result<CommandOutput> {
        debug!("Executing: {}", cmd.display());
        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command, treating a non-zero exit as fatal.
pub fn run_checked(runner: &dyn CommandRunner, cmd: &HostCommand) -> Result<CommandOutput> {
    let output = run_unchecked(runner, cmd)?;
    if !output.success() {
        return Err(ProvisionError::Command {
            command: cmd.display(),
            status: output.status,
            stderr: cmd.mask(output.stderr.trim()),
        });
    }
    Ok(output)
}

/// Run a command and hand back its output whatever the exit status.
///
/// Only failing to spawn the program is an error.
pub fn run_unchecked(runner: &dyn CommandRunner, cmd: &HostCommand) -> Result<CommandOutput> {
    runner
        .run(cmd)
        .map_err(|e| ProvisionError::io(format!("Failed to execute {}", cmd.program), e))
}
