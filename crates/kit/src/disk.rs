//! Network disk XML generation
//!
//! Builds the `<disk type="network">` fragment describing an RBD image,
//! suitable for `virsh attach-device` or for insertion into a domain's
//! `<devices>` section.

use color_eyre::{eyre::eyre, Result};

use crate::config::{MonitorHost, ProvisioningConfig};
use crate::secret::SecretId;

/// Driver name used for every generated disk.
pub const DRIVER_NAME: &str = "qemu";

/// `<auth>` block referencing a libvirt secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskAuth {
    pub username: String,
    pub secret_type: String,
    pub secret_uuid: SecretId,
}

/// Builder for a network-backed disk definition
#[derive(Debug, Default)]
pub struct DiskBuilder {
    device: Option<String>,
    driver_type: Option<String>,
    protocol: Option<String>,
    source_name: Option<String>,
    hosts: Vec<MonitorHost>,
    target_dev: Option<String>,
    target_bus: Option<String>,
    auth: Option<DiskAuth>,
}

impl DiskBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder populated from a provisioning config; `secret` must be given
    /// in the auth case for the `<auth>` block to be emitted.
    pub fn from_config(cfg: &ProvisioningConfig, secret: Option<SecretId>) -> Self {
        let mut builder = Self::new()
            .with_device(&cfg.device)
            .with_driver_type(&cfg.device_format)
            .with_rbd_source(&cfg.disk_name.to_string(), &cfg.hosts)
            .with_target(&cfg.device_target, &cfg.device_bus);
        if let (Some(creds), Some(uuid)) = (cfg.credentials.as_ref(), secret) {
            builder = builder.with_auth(DiskAuth {
                username: creds.auth_user.clone(),
                secret_type: cfg.secret_usage_type.clone(),
                secret_uuid: uuid,
            });
        }
        builder
    }

    /// Set the device kind (disk, lun, cdrom)
    pub fn with_device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    /// Set the image format given to the driver
    pub fn with_driver_type(mut self, format: &str) -> Self {
        self.driver_type = Some(format.to_string());
        self
    }

    /// Use an RBD image served by the given monitors
    pub fn with_rbd_source(mut self, name: &str, hosts: &[MonitorHost]) -> Self {
        self.protocol = Some("rbd".to_string());
        self.source_name = Some(name.to_string());
        self.hosts = hosts.to_vec();
        self
    }

    pub fn with_target(mut self, dev: &str, bus: &str) -> Self {
        self.target_dev = Some(dev.to_string());
        self.target_bus = Some(bus.to_string());
        self
    }

    pub fn with_auth(mut self, auth: DiskAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the disk XML
    pub fn build_xml(self) -> Result<String> {
        let protocol = self
            .protocol
            .ok_or_else(|| eyre!("Disk source protocol is required"))?;
        let name = self
            .source_name
            .ok_or_else(|| eyre!("Disk source name is required"))?;
        let target_dev = self
            .target_dev
            .ok_or_else(|| eyre!("Disk target is required"))?;
        let device = self.device.as_deref().unwrap_or("disk");
        let driver_type = self.driver_type.as_deref().unwrap_or("raw");
        let bus = self.target_bus.as_deref().unwrap_or("virtio");

        let mut xml = format!(
            r#"<disk type="network" device="{}">
  <driver name="{}" type="{}"/>"#,
            escape_xml(device),
            DRIVER_NAME,
            escape_xml(driver_type)
        );

        if let Some(ref auth) = self.auth {
            xml.push_str(&format!(
                r#"
  <auth username="{}">
    <secret type="{}" uuid="{}"/>
  </auth>"#,
                escape_xml(&auth.username),
                escape_xml(&auth.secret_type),
                auth.secret_uuid
            ));
        }

        xml.push_str(&format!(
            r#"
  <source protocol="{}" name="{}">"#,
            escape_xml(&protocol),
            escape_xml(&name)
        ));
        for host in &self.hosts {
            if host.port.is_empty() {
                xml.push_str(&format!(
                    r#"
    <host name="{}"/>"#,
                    escape_xml(&host.name)
                ));
            } else {
                xml.push_str(&format!(
                    r#"
    <host name="{}" port="{}"/>"#,
                    escape_xml(&host.name),
                    escape_xml(&host.port)
                ));
            }
        }
        xml.push_str("\n  </source>");

        xml.push_str(&format!(
            r#"
  <target dev="{}" bus="{}"/>
</disk>"#,
            escape_xml(&target_dev),
            escape_xml(bus)
        ));

        Ok(xml)
    }
}

/// Escape a value for use in XML text or a double-quoted attribute.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;

    const UUID: &str = "3b1a9f4e-7f52-4a0e-9c2c-8a4c1b5d6e7f";

    fn hosts() -> Vec<MonitorHost> {
        vec![MonitorHost {
            name: "10.0.0.1".into(),
            port: "6789".into(),
        }]
    }

    #[test]
    fn test_basic_rbd_disk() {
        let xml = DiskBuilder::new()
            .with_rbd_source("rbd/test.img", &hosts())
            .with_target("vdb", "virtio")
            .build_xml()
            .unwrap();
        similar_asserts::assert_eq!(
            xml,
            r#"<disk type="network" device="disk">
  <driver name="qemu" type="raw"/>
  <source protocol="rbd" name="rbd/test.img">
    <host name="10.0.0.1" port="6789"/>
  </source>
  <target dev="vdb" bus="virtio"/>
</disk>"#
        );
    }

    #[test]
    fn test_auth_block() {
        let xml = DiskBuilder::new()
            .with_rbd_source("rbd/test.img", &hosts())
            .with_target("vdc", "scsi")
            .with_driver_type("qcow2")
            .with_auth(DiskAuth {
                username: "admin".into(),
                secret_type: "ceph".into(),
                secret_uuid: UUID.parse().unwrap(),
            })
            .build_xml()
            .unwrap();
        assert!(xml.contains(r#"<driver name="qemu" type="qcow2"/>"#));
        assert!(xml.contains(&format!(
            "<auth username=\"admin\">\n    <secret type=\"ceph\" uuid=\"{UUID}\"/>\n  </auth>"
        )));
        assert!(xml.contains(r#"<target dev="vdc" bus="scsi"/>"#));
    }

    #[test]
    fn test_missing_source_is_error() {
        assert!(DiskBuilder::new().with_target("vdb", "virtio").build_xml().is_err());
        assert!(DiskBuilder::new()
            .with_rbd_source("a/b", &hosts())
            .build_xml()
            .is_err());
    }

    #[test]
    fn test_from_config_without_credentials_ignores_secret() {
        let params: Params = [("ceph_disk_name", "rbd/a"), ("ceph_mon_ip", "m1,m2")]
            .into_iter()
            .collect();
        let cfg = ProvisioningConfig::from_params(&params).unwrap();
        let xml = DiskBuilder::from_config(&cfg, Some(UUID.parse().unwrap()))
            .build_xml()
            .unwrap();
        assert!(!xml.contains("<auth"));
        assert!(xml.contains(r#"<host name="m1" port="EXAMPLE_PORTS"/>"#));
        assert!(xml.contains(r#"<host name="m2" port="EXAMPLE_PORTS"/>"#));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape_xml(r#"a<b>&"c'"#), "a&lt;b&gt;&amp;&quot;c&apos;");
        let xml = DiskBuilder::new()
            .with_rbd_source("p/i\"x", &[])
            .with_target("vdb", "virtio")
            .build_xml()
            .unwrap();
        assert!(xml.contains(r#"name="p/i&quot;x""#));
    }
}
