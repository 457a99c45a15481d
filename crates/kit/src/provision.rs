//! Attach and detach a Ceph RBD disk for the duration of a test
//!
//! [`DiskProvisioner::setup`] prepares credentials, (re)creates the remote
//! image and hands the disk to the domain, either live or through its
//! persistent definition. [`DiskProvisioner::teardown`] releases everything
//! listed in the [`ProvisionRecord`] that setup filled in.

use std::fmt;
use std::io::{ErrorKind, Write as _};
use std::os::unix::fs::OpenOptionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info, warn};

use crate::ceph;
use crate::config::{Credentials, ProvisioningConfig, SECRET_USAGE_NAME};
use crate::disk::DiskBuilder;
use crate::domain::DomainXml;
use crate::error::{ProvisionError, Result};
use crate::exec::CommandRunner;
use crate::package::{self, CEPH_CLIENT_PACKAGE};
use crate::params::Params;
use crate::qemu_img;
use crate::record::ProvisionRecord;
use crate::secret::{self, SecretId};
use crate::virsh::Virsh;

/// Orchestrates the external tools needed for one RBD-backed disk.
pub struct DiskProvisioner<'a> {
    runner: &'a dyn CommandRunner,
}

impl std::fmt::Debug for DiskProvisioner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskProvisioner").finish_non_exhaustive()
    }
}

impl<'a> DiskProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Single entry point: set up when `is_setup`, otherwise tear down.
    pub fn run(
        &self,
        vm_name: &str,
        params: &Params,
        is_setup: bool,
        record: &mut ProvisionRecord,
    ) -> Result<()> {
        let cfg = ProvisioningConfig::from_params(params)?;
        if is_setup {
            self.setup(vm_name, &cfg, record)
        } else {
            self.teardown(vm_name, &cfg, record)
        }
    }

    /// Create the remote image and attach it to `vm_name`.
    ///
    /// Every resource is added to `record` as soon as it exists, so on
    /// failure the record still lists what teardown has to release.
    pub fn setup(
        &self,
        vm_name: &str,
        cfg: &ProvisioningConfig,
        record: &mut ProvisionRecord,
    ) -> Result<()> {
        info!("Setting up RBD disk {} for {vm_name}", cfg.disk_name);
        check_reusable(vm_name, cfg, record)?;
        package::ensure_installed(self.runner, &[CEPH_CLIENT_PACKAGE])?;

        create_scratch_dir(cfg.ceph_conf_dir(), record)?;
        if let Some(path) = ceph::create_config_file(cfg.ceph_conf_dir(), &cfg.mon_host)? {
            record.cluster_config = Some(path);
        }

        let virsh = Virsh::new(self.runner, cfg.virsh_connect.clone());
        let secret = match cfg.credentials {
            Some(ref creds) => Some(self.prepare_auth(&virsh, cfg, creds, record)?),
            None => None,
        };

        let keyring = cfg.keyring_path();
        ceph::remove_image(
            self.runner,
            &cfg.mon_host,
            &cfg.disk_name.pool,
            &cfg.disk_name.image,
            keyring.as_deref(),
        )?;

        let local_image = match cfg.image_file {
            Some(ref path) => {
                debug!("Using caller-supplied image {path}");
                path.clone()
            }
            None => {
                let path = cfg.synthesized_image(vm_name);
                create_scratch_dir(&cfg.dirs.data_dir, record)?;
                record.local_image = Some(path.clone());
                qemu_img::create(self.runner, &cfg.device_format, &path, &cfg.storage_size)?;
                path
            }
        };

        record.remote_image = Some(cfg.disk_name.clone());
        self.upload_image(cfg, &local_image)?;

        let disk_xml = DiskBuilder::from_config(cfg, secret)
            .build_xml()
            .map_err(|e| ProvisionError::Xml(format!("{e:#}")))?;
        debug!("New disk XML: {disk_xml}");

        if cfg.keep_raw_image_as {
            info!("keep_raw_image_as is set; leaving {vm_name} unchanged");
            return Ok(());
        }
        if cfg.hotplug {
            info!("Hot-plugging {} into {vm_name}", cfg.device_target);
            virsh.attach_device(vm_name, &disk_xml, &cfg.attach_option)?;
        } else {
            let mut domain = DomainXml::dump(&virsh, vm_name)?;
            domain.add_device(&disk_xml)?;
            domain.sync(&virsh)?;
        }
        Ok(())
    }

    /// Write the keyring and register the key as a libvirt secret.
    fn prepare_auth(
        &self,
        virsh: &Virsh<'_>,
        cfg: &ProvisioningConfig,
        creds: &Credentials,
        record: &mut ProvisionRecord,
    ) -> Result<SecretId> {
        if let Some(old) = record.secret {
            info!("Replacing secret {old} from an earlier setup");
            secret::undefine_secret(virsh, &old)?;
            record.secret = None;
        }

        let key_file = cfg.key_file();
        create_scratch_dir(&cfg.dirs.tmp_dir, record)?;
        record.key_file = Some(key_file.clone());
        write_key_file(&key_file, creds)?;

        let device_source = ceph::rbd_locator(&cfg.disk_name, &cfg.mon_host, None);
        debug!("Device source is {device_source}:keyring={key_file}");

        secret::create_secret(
            virsh,
            &cfg.secret_usage_type,
            SECRET_USAGE_NAME,
            &creds.auth_key,
            |id| record.secret = Some(id),
        )
    }

    /// Copy the local image into the cluster unless it is already there.
    fn upload_image(&self, cfg: &ProvisioningConfig, local_image: &Utf8Path) -> Result<()> {
        let keyring = cfg.keyring_path();
        if ceph::image_exists(self.runner, &cfg.mon_host, &cfg.disk_name, keyring.as_deref())? {
            info!(
                "Remote image {} already exists; skipping conversion",
                cfg.disk_name
            );
            return Ok(());
        }
        let locator = ceph::rbd_locator(&cfg.disk_name, &cfg.mon_host, cfg.credentials.as_ref());
        info!("Converting {local_image} to {}", cfg.disk_name);
        qemu_img::convert(
            self.runner,
            &cfg.device_format,
            local_image,
            &locator,
            cfg.credentials.as_ref().map(|c| c.auth_key.as_str()),
        )
    }

    /// Release everything listed in `record`.
    ///
    /// Entries are cleared as they are released; on error the record holds
    /// what is left.
    pub fn teardown(
        &self,
        vm_name: &str,
        cfg: &ProvisioningConfig,
        record: &mut ProvisionRecord,
    ) -> Result<()> {
        info!("Tearing down RBD disk {} for {vm_name}", cfg.disk_name);
        package::ensure_installed(self.runner, &[CEPH_CLIENT_PACKAGE])?;

        let name = record.remote_image.clone().unwrap_or_else(|| cfg.disk_name.clone());
        let keyring = cfg.keyring_path().filter(|k| k.exists());
        ceph::remove_image(
            self.runner,
            &cfg.mon_host,
            &name.pool,
            &name.image,
            keyring.as_deref(),
        )?;
        record.remote_image = None;

        for slot in [&mut record.key_file, &mut record.cluster_config] {
            if let Some(path) = slot.as_deref() {
                ceph::remove_owned_file(path)?;
            }
            *slot = None;
        }
        if let Some(path) = record.local_image.as_deref() {
            if cfg.image_file.as_deref() == Some(path) {
                warn!("Not removing caller-supplied image {path}");
            } else {
                ceph::remove_owned_file(path)?;
            }
        }
        record.local_image = None;

        if let Some(id) = record.secret {
            let virsh = Virsh::new(self.runner, cfg.virsh_connect.clone());
            secret::undefine_secret(&virsh, &id)?;
            record.secret = None;
        }

        prune_scratch_dirs(record)
    }
}

/// A record carried over from an earlier setup must describe the same
/// resources this configuration would create, or teardown would leak some.
fn check_reusable(vm_name: &str, cfg: &ProvisioningConfig, record: &ProvisionRecord) -> Result<()> {
    if record.vm_name != vm_name {
        return Err(ProvisionError::Configuration(format!(
            "Existing state belongs to {}, not {vm_name}",
            record.vm_name
        )));
    }
    ensure_same("key file", record.key_file.as_ref(), &cfg.key_file())?;
    ensure_same(
        "cluster config",
        record.cluster_config.as_ref(),
        &ceph::config_file_path(cfg.ceph_conf_dir()),
    )?;
    ensure_same(
        "local image",
        record.local_image.as_ref(),
        &cfg.synthesized_image(vm_name),
    )?;
    ensure_same("remote image", record.remote_image.as_ref(), &cfg.disk_name)
}

fn ensure_same<T: PartialEq + fmt::Display>(what: &str, recorded: Option<&T>, wanted: &T) -> Result<()> {
    match recorded {
        Some(r) if r != wanted => Err(ProvisionError::Configuration(format!(
            "Existing state records {what} {r} but this setup uses {wanted}; run teardown first"
        ))),
        _ => Ok(()),
    }
}

/// Create `dir` and record every directory level that did not exist yet.
pub(crate) fn create_scratch_dir(dir: &Utf8Path, record: &mut ProvisionRecord) -> Result<()> {
    let missing: Vec<Utf8PathBuf> = dir
        .ancestors()
        .take_while(|d| !d.as_str().is_empty() && !d.exists())
        .map(Utf8Path::to_path_buf)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| ProvisionError::io(format!("Creating {dir}"), e))?;
    for d in missing.into_iter().rev() {
        if !record.created_dirs.contains(&d) {
            debug!("Created scratch directory {d}");
            record.created_dirs.push(d);
        }
    }
    Ok(())
}

/// Remove recorded directories that are now empty, innermost first.
///
/// Directories that still hold something stay in the record.
pub(crate) fn prune_scratch_dirs(record: &mut ProvisionRecord) -> Result<()> {
    let dirs = std::mem::take(&mut record.created_dirs);
    let mut kept = Vec::new();
    let mut result = Ok(());
    for dir in dirs.into_iter().rev() {
        if result.is_err() {
            kept.push(dir);
            continue;
        }
        match remove_empty_dir(&dir) {
            Ok(true) => {}
            Ok(false) => kept.push(dir),
            Err(e) => {
                kept.push(dir);
                result = Err(e);
            }
        }
    }
    kept.reverse();
    record.created_dirs = kept;
    result
}

/// Returns false if `dir` is not empty.
fn remove_empty_dir(dir: &Utf8Path) -> Result<bool> {
    let mut entries = match dir.read_dir_utf8() {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(ProvisionError::io(format!("Reading {dir}"), e)),
    };
    if entries.next().is_some() {
        debug!("Keeping non-empty {dir}");
        return Ok(false);
    }
    std::fs::remove_dir(dir).map_err(|e| ProvisionError::io(format!("Removing {dir}"), e))?;
    debug!("Removed {dir}");
    Ok(true)
}

fn write_key_file(path: &Utf8Path, creds: &Credentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::io(format!("Creating {parent}"), e))?;
    }
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| ProvisionError::io(format!("Opening {path}"), e))?;
    f.write_all(creds.keyring().as_bytes())
        .map_err(|e| ProvisionError::io(format!("Writing {path}"), e))?;
    debug!("Wrote keyring {path}");
    Ok(())
}
