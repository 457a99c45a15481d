//! Error taxonomy for disk provisioning
//!
//! Setup fails fast with one of these; the CLI converts them into
//! `color_eyre` reports at the top level.

use std::process::ExitStatus;

use thiserror::Error;

/// Errors raised while provisioning or tearing down an RBD disk.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A required host package is missing and could not be installed.
    #[error("failed to install required package(s): {packages}")]
    Dependency { packages: String },

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    /// The test parameters cannot describe a valid disk.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A local I/O operation failed.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A domain or secret document could not be handled.
    #[error("malformed XML: {0}")]
    Xml(String),
}

impl ProvisionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
