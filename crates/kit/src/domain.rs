//! Persisted domain XML editing
//!
//! The stored definition is dumped, a device fragment is spliced into its
//! `<devices>` section, and the result is defined again.

use tracing::{debug, info};

use crate::error::{ProvisionError, Result};
use crate::virsh::Virsh;

/// The persistent XML definition of one domain.
#[derive(Debug, Clone)]
pub struct DomainXml {
    name: String,
    xml: String,
}

impl DomainXml {
    /// Read the inactive definition of `name`.
    pub fn dump(virsh: &Virsh<'_>, name: &str) -> Result<Self> {
        let xml = virsh.dumpxml_inactive(name)?;
        debug!("Original XML of {name}: {xml}");
        Ok(Self::from_xml(name, xml))
    }

    pub fn from_xml(name: &str, xml: String) -> Self {
        Self {
            name: name.to_string(),
            xml,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    /// Insert `device` as the last child of `<devices>`.
    pub fn add_device(&mut self, device: &str) -> Result<()> {
        let end = self.xml.rfind("</devices>").ok_or_else(|| {
            ProvisionError::Xml(format!("Domain {} has no <devices> section", self.name))
        })?;
        let indent = line_indent(&self.xml, end);
        let child_indent = format!("{indent}  ");
        let mut fragment = String::new();
        for line in device.trim().lines() {
            fragment.push_str(&child_indent);
            fragment.push_str(line);
            fragment.push('\n');
        }
        fragment.push_str(indent);
        // Replace the indentation preceding the closing tag with our fragment
        let line_start = end - indent.len();
        self.xml.replace_range(line_start..end, &fragment);
        Ok(())
    }

    /// Define the modified XML, replacing the stored configuration.
    pub fn sync(&self, virsh: &Virsh<'_>) -> Result<()> {
        virsh.define(self.as_str())?;
        info!("Updated persistent definition of {}", self.name);
        Ok(())
    }
}

/// Whitespace between the start of the line and byte `pos`, if the line is
/// indentation only up to that point.
fn line_indent(s: &str, pos: usize) -> &str {
    let line_start = s[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let prefix = &s[line_start..pos];
    if prefix.chars().all(|c| c == ' ' || c == '\t') {
        prefix
    } else {
        ""
    }
}
