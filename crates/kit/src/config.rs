//! Provisioning configuration derived from test parameters
//!
//! The configuration is rebuilt from parameters on every invocation, so
//! setup and teardown can run in separate processes as long as they see
//! the same parameters.

use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, Result};
use crate::params::Params;

pub const DEFAULT_DEVICE_FORMAT: &str = "raw";
pub const DEFAULT_DEVICE_BUS: &str = "virtio";
pub const DEFAULT_DEVICE: &str = "disk";
pub const DEFAULT_DEVICE_TARGET: &str = "vdb";
pub const DEFAULT_ATTACH_OPTION: &str = "--live";
pub const DEFAULT_MON_HOST: &str = "EXAMPLE_MON_HOST";
pub const DEFAULT_HOST_PORT: &str = "EXAMPLE_PORTS";
pub const DEFAULT_DISK_NAME: &str = "EXAMPLE_SOURCE_NAME";
pub const DEFAULT_SECRET_USAGE: &str = "ceph";
pub const DEFAULT_STORAGE_SIZE: &str = "1G";
pub const DEFAULT_CEPH_CONF_DIR: &str = "/etc/ceph";

/// Usage name given to the libvirt secret holding the Ceph key.
pub const SECRET_USAGE_NAME: &str = "ceph_auth_secret";

const KEY_FILE_NAME: &str = "ceph.key";

/// A remote RBD image, always addressed as `pool/image`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageName {
    pub pool: String,
    pub image: String,
}

impl FromStr for ImageName {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(pool), Some(image), None) if !pool.is_empty() && !image.is_empty() => {
                Ok(Self {
                    pool: pool.to_string(),
                    image: image.to_string(),
                })
            }
            _ => Err(ProvisionError::Configuration(format!(
                "ceph_disk_name must be of the form pool/image, got: {s:?}"
            ))),
        }
    }
}

impl TryFrom<String> for ImageName {
    type Error = ProvisionError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ImageName> for String {
    fn from(name: ImageName) -> Self {
        name.to_string()
    }
}

impl fmt::Display for ImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)
    }
}

/// Ceph credentials; only present when both client name and key are set.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Keyring section name, e.g. `client.admin`
    pub client_name: String,
    pub client_key: String,
    /// User placed in the disk `<auth>` element and the inline locator
    pub auth_user: String,
    /// Key stored in the libvirt secret and the inline locator
    pub auth_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("client_name", &self.client_name)
            .field("client_key", &"<redacted>")
            .field("auth_user", &self.auth_user)
            .field("auth_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Content of the keyring file handed to `rbd --keyring`.
    pub fn keyring(&self) -> String {
        format!("[{}]\n\tkey = {}\n", self.client_name, self.client_key)
    }
}

/// A Ceph monitor endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorHost {
    pub name: String,
    pub port: String,
}

/// Scratch locations used for files this tool creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDirs {
    /// Holds the key file
    pub tmp_dir: Utf8PathBuf,
    /// Holds synthesized local images
    pub data_dir: Utf8PathBuf,
    /// Where the cluster config file lives
    pub ceph_conf_dir: Utf8PathBuf,
}

impl ScratchDirs {
    fn from_params(params: &Params) -> Result<Self> {
        let tmp_dir = match params.get_nonempty("tmp_dir") {
            Some(d) => Utf8PathBuf::from(d),
            None => {
                let base = Utf8PathBuf::try_from(std::env::temp_dir()).map_err(|e| {
                    ProvisionError::Configuration(format!("Temporary directory is not UTF-8: {e}"))
                })?;
                base.join("rbdkit")
            }
        };
        let data_dir = params
            .get_nonempty("data_dir")
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| tmp_dir.join("data"));
        let ceph_conf_dir = Utf8PathBuf::from(params.get_or("ceph_conf_dir", DEFAULT_CEPH_CONF_DIR));
        Ok(Self {
            tmp_dir,
            data_dir,
            ceph_conf_dir,
        })
    }
}

/// Everything needed to provision one RBD disk for one domain.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub device_format: String,
    pub device_bus: String,
    pub device: String,
    pub device_target: String,
    pub hotplug: bool,
    pub attach_option: String,
    pub keep_raw_image_as: bool,
    /// Monitor addresses as given, comma separated
    pub mon_host: String,
    pub hosts: Vec<MonitorHost>,
    pub disk_name: ImageName,
    pub credentials: Option<Credentials>,
    pub secret_usage_type: String,
    pub storage_size: String,
    /// Caller-supplied local image; never deleted by teardown
    pub image_file: Option<Utf8PathBuf>,
    pub dirs: ScratchDirs,
    pub virsh_connect: Option<String>,
}

impl ProvisioningConfig {
    pub fn from_params(params: &Params) -> Result<Self> {
        let mon_host = params.get_or("ceph_mon_ip", DEFAULT_MON_HOST).to_string();
        let hosts = pair_hosts(&mon_host, params.get_or("ceph_host_port", DEFAULT_HOST_PORT))?;
        let disk_name = params.get_or("ceph_disk_name", DEFAULT_DISK_NAME).parse()?;

        let credentials = match (
            params.get_nonempty("ceph_client_name"),
            params.get_nonempty("ceph_client_key"),
        ) {
            (Some(name), Some(key)) => Some(Credentials {
                client_name: name.to_string(),
                client_key: key.to_string(),
                auth_user: params.get_nonempty("ceph_auth_user").unwrap_or(name).to_string(),
                auth_key: params.get_nonempty("ceph_auth_key").unwrap_or(key).to_string(),
            }),
            _ => None,
        };

        Ok(Self {
            device_format: params
                .get_or("virt_disk_device_format", DEFAULT_DEVICE_FORMAT)
                .to_string(),
            device_bus: params
                .get_or("virt_disk_device_bus", DEFAULT_DEVICE_BUS)
                .to_string(),
            device: params.get_or("virt_disk_device", DEFAULT_DEVICE).to_string(),
            device_target: params
                .get_or("virt_disk_device_target", DEFAULT_DEVICE_TARGET)
                .to_string(),
            hotplug: params.is_yes("virt_disk_device_hotplug"),
            attach_option: params
                .get_or("virt_device_attach_option", DEFAULT_ATTACH_OPTION)
                .to_string(),
            keep_raw_image_as: params.is_yes("keep_raw_image_as"),
            mon_host,
            hosts,
            disk_name,
            credentials,
            secret_usage_type: params
                .get_or("ceph_auth_sec_usage_type", DEFAULT_SECRET_USAGE)
                .to_string(),
            storage_size: params
                .get_or("storage_size", DEFAULT_STORAGE_SIZE)
                .to_string(),
            image_file: params.get_nonempty("ceph_image_file").map(Utf8PathBuf::from),
            dirs: ScratchDirs::from_params(params)?,
            virsh_connect: params.get_nonempty("virsh_connect").map(str::to_string),
        })
    }

    pub fn is_auth_case(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn key_file(&self) -> Utf8PathBuf {
        self.dirs.tmp_dir.join(KEY_FILE_NAME)
    }

    /// Path used for the local image when the caller supplied none.
    pub fn synthesized_image(&self, vm_name: &str) -> Utf8PathBuf {
        self.dirs.data_dir.join(format!("{vm_name}_test.img"))
    }

    /// Keyring path passed to `rbd`, only in the auth case.
    pub fn keyring_path(&self) -> Option<Utf8PathBuf> {
        self.is_auth_case().then(|| self.key_file())
    }

    pub fn ceph_conf_dir(&self) -> &Utf8Path {
        &self.dirs.ceph_conf_dir
    }

    /// Resolved settings as display pairs, with credentials redacted.
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        let yes_no = |b: bool| if b { "yes" } else { "no" }.to_string();
        let mut out = vec![
            ("device", self.device.clone()),
            ("device_format", self.device_format.clone()),
            ("device_bus", self.device_bus.clone()),
            ("device_target", self.device_target.clone()),
            ("hotplug", yes_no(self.hotplug)),
            ("attach_option", self.attach_option.clone()),
            ("keep_raw_image_as", yes_no(self.keep_raw_image_as)),
            ("mon_host", self.mon_host.clone()),
            (
                "hosts",
                self.hosts
                    .iter()
                    .map(|h| format!("{}:{}", h.name, h.port))
                    .join(","),
            ),
            ("disk_name", self.disk_name.to_string()),
            ("auth", yes_no(self.is_auth_case())),
        ];
        if let Some(ref c) = self.credentials {
            out.push(("client_name", c.client_name.clone()));
            out.push(("auth_user", c.auth_user.clone()));
            out.push(("secret_usage_type", self.secret_usage_type.clone()));
        }
        out.extend([
            ("storage_size", self.storage_size.clone()),
            (
                "image_file",
                self.image_file
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
            ),
            ("tmp_dir", self.dirs.tmp_dir.to_string()),
            ("data_dir", self.dirs.data_dir.to_string()),
            ("ceph_conf_dir", self.dirs.ceph_conf_dir.to_string()),
        ]);
        out
    }
}

/// Pair each monitor with a port. A single port applies to every monitor.
fn pair_hosts(mon_host: &str, ports: &str) -> Result<Vec<MonitorHost>> {
    let names = split_list(mon_host);
    let ports = split_list(ports);
    if names.is_empty() {
        return Err(ProvisionError::Configuration(
            "ceph_mon_ip must name at least one monitor".into(),
        ));
    }
    let ports = match ports.len() {
        0 => vec![String::new(); names.len()],
        1 => vec![ports[0].clone(); names.len()],
        n if n == names.len() => ports,
        n => {
            return Err(ProvisionError::Configuration(format!(
                "ceph_host_port lists {n} ports for {} monitors",
                names.len()
            )))
        }
    };
    Ok(names
        .into_iter()
        .zip_eq(ports)
        .map(|(name, port)| MonitorHost { name, port })
        .collect())
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
