//! libvirt secrets holding the Ceph authentication key

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::disk::escape_xml;
use crate::error::{ProvisionError, Result};
use crate::virsh::{Undefined, Virsh};

/// Identifier of a libvirt secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretId(Uuid);

impl SecretId {
    /// Extract the UUID from `virsh secret-define` output
    /// (`Secret <uuid> created`).
    pub(crate) fn from_define_output(stdout: &str) -> Result<Self> {
        stdout
            .split_whitespace()
            .find_map(|word| word.parse().ok())
            .ok_or_else(|| {
                ProvisionError::Xml(format!(
                    "No secret UUID in secret-define output: {:?}",
                    stdout.trim()
                ))
            })
    }
}

impl FromStr for SecretId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for SecretId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Secret definition for `usage_type`, identified by `usage_name`.
///
/// The usage element depends on the type: iSCSI secrets are keyed by
/// target, volume secrets by volume path, everything else by name.
pub fn secret_xml(usage_type: &str, usage_name: &str, description: &str) -> String {
    let usage_elem = match usage_type {
        "iscsi" => "target",
        "volume" => "volume",
        _ => "name",
    };
    format!(
        r#"<secret ephemeral="no" private="yes">
  <description>{}</description>
  <usage type="{}">
    <{usage_elem}>{}</{usage_elem}>
  </usage>
</secret>
"#,
        escape_xml(description),
        escape_xml(usage_type),
        escape_xml(usage_name),
    )
}

/// Define a secret and store `base64_value` in it.
///
/// `on_defined` runs as soon as the secret exists, before the value is set,
/// so a caller can record it even if setting the value fails.
pub fn create_secret(
    virsh: &Virsh<'_>,
    usage_type: &str,
    usage_name: &str,
    base64_value: &str,
    on_defined: impl FnOnce(SecretId),
) -> Result<SecretId> {
    let xml = secret_xml(usage_type, usage_name, "rbdkit ceph authentication key");
    let id = virsh.secret_define(&xml)?;
    on_defined(id);
    info!("Defined {usage_type} secret {id}");
    virsh.secret_set_value(&id, base64_value)?;
    Ok(id)
}

/// Undefine a secret; a secret that no longer exists is not an error.
pub fn undefine_secret(virsh: &Virsh<'_>, id: &SecretId) -> Result<()> {
    match virsh.secret_undefine(id)? {
        Undefined::Removed => info!("Undefined secret {id}"),
        Undefined::NotFound => warn!("Secret {id} was already undefined"),
    }
    Ok(())
}
