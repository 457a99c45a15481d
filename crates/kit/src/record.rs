//! Ownership record for resources created during setup
//!
//! Setup fills the record as it goes; teardown consumes it. The CLI keeps
//! it in a JSON state file between the two invocations.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use color_eyre::eyre::Context;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{ImageName, ProvisioningConfig};
use crate::secret::SecretId;

/// Everything setup created that teardown must release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRecord {
    pub vm_name: String,
    pub created_at: DateTime<Utc>,
    /// Keyring file written for `rbd --keyring`
    pub key_file: Option<Utf8PathBuf>,
    /// Cluster config, only when it did not exist before setup
    pub cluster_config: Option<Utf8PathBuf>,
    /// Local image synthesized by setup; caller-supplied images are never recorded
    pub local_image: Option<Utf8PathBuf>,
    pub secret: Option<SecretId>,
    pub remote_image: Option<ImageName>,
    /// Directories setup had to create, outermost first
    #[serde(default)]
    pub created_dirs: Vec<Utf8PathBuf>,
}

impl ProvisionRecord {
    pub fn new(vm_name: &str) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            created_at: Utc::now(),
            key_file: None,
            cluster_config: None,
            local_image: None,
            secret: None,
            remote_image: None,
            created_dirs: Vec::new(),
        }
    }

    /// Best-effort record for a teardown that has no saved state.
    ///
    /// Paths are deterministic so they can be recomputed. The secret and
    /// cluster config ownership cannot be, and are left out.
    pub fn reconstruct(vm_name: &str, cfg: &ProvisioningConfig) -> Self {
        let mut record = Self::new(vm_name);
        record.key_file = Some(cfg.key_file());
        if cfg.image_file.is_none() {
            record.local_image = Some(cfg.synthesized_image(vm_name));
        }
        record.remote_image = Some(cfg.disk_name.clone());
        if cfg.is_auth_case() {
            warn!("No saved state for {vm_name}; any auth secret must be removed manually");
        }
        record
    }

    /// Default state file location for a domain.
    pub fn default_path(cfg: &ProvisioningConfig, vm_name: &str) -> Utf8PathBuf {
        cfg.dirs.tmp_dir.join(format!("{vm_name}.rbdkit-state.json"))
    }

    pub fn load(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        serde_json::from_str(&buf).with_context(|| format!("Parsing {path}"))
    }

    /// Load the record if the state file exists.
    pub fn load_optional(path: &Utf8Path) -> Result<Option<Self>> {
        if !path.exists() {
            debug!("No state file at {path}");
            return Ok(None);
        }
        Self::load(path).map(Some)
    }

    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        let buf = serde_json::to_string_pretty(self)?;
        std::fs::write(path, buf).with_context(|| format!("Writing {path}"))?;
        debug!("Saved state to {path}");
        Ok(())
    }

    /// Whether teardown has anything left to release.
    pub fn is_empty(&self) -> bool {
        self.key_file.is_none()
            && self.cluster_config.is_none()
            && self.local_image.is_none()
            && self.secret.is_none()
            && self.remote_image.is_none()
            && self.created_dirs.is_empty()
    }
}
