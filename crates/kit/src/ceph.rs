//! Ceph cluster helpers built on the `rbd` CLI

use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};
use indoc::formatdoc;
use tracing::{debug, info};

use crate::config::{Credentials, ImageName};
use crate::error::{ProvisionError, Result};
use crate::exec::{run_checked, run_unchecked, CommandRunner, HostCommand};

const CONFIG_FILE_NAME: &str = "ceph.conf";

/// Write a minimal `ceph.conf` pointing at `mon_host` unless one exists.
///
/// Returns the path only when this call created the file, so callers never
/// take ownership of a pre-existing cluster configuration.
pub fn create_config_file(dir: &Utf8Path, mon_host: &str) -> Result<Option<Utf8PathBuf>> {
    let path = config_file_path(dir);
    if path.exists() {
        debug!("Keeping existing cluster config {path}");
        return Ok(None);
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| ProvisionError::io(format!("Creating {dir}"), e))?;
    let content = formatdoc! {"
        [global]
        mon_host = {mon_host}
    "};
    std::fs::write(&path, content)
        .map_err(|e| ProvisionError::io(format!("Writing {path}"), e))?;
    info!("Created cluster config {path}");
    Ok(Some(path))
}

/// Location of the cluster config inside `dir`.
pub fn config_file_path(dir: &Utf8Path) -> Utf8PathBuf {
    dir.join(CONFIG_FILE_NAME)
}

fn rbd_command(mon_host: &str, keyring: Option<&Utf8Path>) -> HostCommand {
    let cmd = HostCommand::new("rbd").args(["-m", mon_host]);
    match keyring {
        Some(k) => cmd.args(["--keyring", k.as_str()]),
        None => cmd,
    }
}

/// Whether `rbd info` can see the image.
pub fn image_exists(
    runner: &dyn CommandRunner,
    mon_host: &str,
    name: &ImageName,
    keyring: Option<&Utf8Path>,
) -> Result<bool> {
    let cmd = rbd_command(mon_host, keyring).arg("info").arg(name.to_string());
    let output = run_unchecked(runner, &cmd)?;
    if !output.success() {
        debug!("rbd info {name}: {}", output.stderr.trim());
    }
    Ok(output.success())
}

/// Remove an RBD image; an image that does not exist is not an error.
pub fn remove_image(
    runner: &dyn CommandRunner,
    mon_host: &str,
    pool: &str,
    image: &str,
    keyring: Option<&Utf8Path>,
) -> Result<()> {
    let name = ImageName {
        pool: pool.to_string(),
        image: image.to_string(),
    };
    if !image_exists(runner, mon_host, &name, keyring)? {
        debug!("Remote image {name} not present, nothing to remove");
        return Ok(());
    }
    let cmd = rbd_command(mon_host, keyring).args(["rm", &name.to_string()]);
    run_checked(runner, &cmd)?;
    info!("Removed remote image {name}");
    Ok(())
}

/// qemu `rbd:` locator for an image, with inline credentials when given.
pub fn rbd_locator(name: &ImageName, mon_host: &str, credentials: Option<&Credentials>) -> String {
    // qemu uses ':' to separate options; monitors must be separated by ';'
    let mon_host = mon_host.replace(',', "\\;");
    let mut locator = format!("rbd:{name}:mon_host={mon_host}");
    if let Some(c) = credentials {
        locator.push_str(&format!(":id={}:key={}", c.auth_user, c.auth_key));
    }
    locator
}

/// Remove a file this tool owns, tolerating its absence.
pub(crate) fn remove_owned_file(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {path}");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(format!("Removing {path}"), e)),
    }
}
