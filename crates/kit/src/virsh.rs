//! Thin wrappers over the `virsh` commands this tool needs

use std::io::Write as _;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ProvisionError, Result};
use crate::exec::{run_checked, run_unchecked, CommandRunner, HostCommand};
use crate::secret::SecretId;

/// A `virsh` client bound to an optional connection URI.
pub struct Virsh<'a> {
    runner: &'a dyn CommandRunner,
    connect: Option<String>,
}

impl std::fmt::Debug for Virsh<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Virsh").field("connect", &self.connect).finish()
    }
}

/// Outcome of undefining a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Undefined {
    Removed,
    NotFound,
}

impl<'a> Virsh<'a> {
    pub fn new(runner: &'a dyn CommandRunner, connect: Option<String>) -> Self {
        Self { runner, connect }
    }

    /// Build a virsh command with optional connection URI
    fn command(&self) -> HostCommand {
        let cmd = HostCommand::new("virsh");
        match self.connect {
            Some(ref connect) => cmd.args(["-c", connect.as_str()]),
            None => cmd,
        }
    }

    /// Persistent domain XML, including security-sensitive elements.
    pub fn dumpxml_inactive(&self, domain: &str) -> Result<String> {
        let cmd = self
            .command()
            .args(["dumpxml", "--inactive", "--security-info", domain]);
        Ok(run_checked(self.runner, &cmd)?.stdout)
    }

    pub fn define(&self, xml: &str) -> Result<()> {
        let file = xml_tempfile(xml)?;
        let cmd = self.command().args(["define", path_str(&file)?]);
        run_checked(self.runner, &cmd)?;
        Ok(())
    }

    /// Attach a device; `flags` is a shell-style option string such as `--live --config`.
    pub fn attach_device(&self, domain: &str, xml: &str, flags: &str) -> Result<()> {
        let flags = shlex::split(flags).ok_or_else(|| {
            ProvisionError::Configuration(format!("Cannot parse attach options: {flags:?}"))
        })?;
        let file = xml_tempfile(xml)?;
        let cmd = self
            .command()
            .args(["attach-device", domain, path_str(&file)?])
            .args(flags);
        run_checked(self.runner, &cmd)?;
        Ok(())
    }

    pub fn secret_define(&self, xml: &str) -> Result<SecretId> {
        let file = xml_tempfile(xml)?;
        let cmd = self.command().args(["secret-define", path_str(&file)?]);
        let output = run_checked(self.runner, &cmd)?;
        SecretId::from_define_output(&output.stdout)
    }

    /// Store a base64-encoded value; it is passed through a file so it never
    /// shows up in the process list.
    pub fn secret_set_value(&self, id: &SecretId, base64_value: &str) -> Result<()> {
        let mut file = NamedTempFile::new()
            .map_err(|e| ProvisionError::io("Creating secret value file", e))?;
        file.write_all(base64_value.as_bytes())
            .map_err(|e| ProvisionError::io("Writing secret value file", e))?;
        let cmd = self.command().args([
            "secret-set-value",
            "--secret",
            &id.to_string(),
            "--file",
            path_str(&file)?,
        ]);
        run_checked(self.runner, &cmd)?;
        Ok(())
    }

    pub fn secret_undefine(&self, id: &SecretId) -> Result<Undefined> {
        let cmd = self.command().arg("secret-undefine").arg(id.to_string());
        let output = run_unchecked(self.runner, &cmd)?;
        if output.success() {
            return Ok(Undefined::Removed);
        }
        let stderr = output.stderr.to_lowercase();
        if stderr.contains("not found") || stderr.contains("no secret with matching uuid") {
            debug!("Secret {id} already gone");
            return Ok(Undefined::NotFound);
        }
        Err(ProvisionError::Command {
            command: cmd.display(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

fn xml_tempfile(xml: &str) -> Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("rbdkit-")
        .suffix(".xml")
        .tempfile()
        .map_err(|e| ProvisionError::io("Creating XML file", e))?;
    file.write_all(xml.as_bytes())
        .map_err(|e| ProvisionError::io("Writing XML file", e))?;
    Ok(file)
}

fn path_str(file: &NamedTempFile) -> Result<&str> {
    file.path().to_str().ok_or_else(|| {
        ProvisionError::Configuration(format!(
            "Temporary file path is not UTF-8: {}",
            file.path().display()
        ))
    })
}
