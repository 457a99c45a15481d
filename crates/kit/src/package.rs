//! Host package management
//!
//! Only the operations needed to make sure the Ceph client tools are
//! present: query, then install what is missing.

use std::io::ErrorKind;

use strum::{Display, EnumIter, IntoEnumIterator};
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::exec::{CommandRunner, HostCommand};

/// Package providing the `rbd` client.
pub const CEPH_CLIENT_PACKAGE: &str = "ceph-common";

/// Supported package database families, probed in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
enum PackageManager {
    Rpm,
    Dpkg,
}

impl PackageManager {
    fn query(self, name: &str) -> HostCommand {
        match self {
            Self::Rpm => HostCommand::new("rpm").args(["-q", name]),
            Self::Dpkg => HostCommand::new("dpkg").args(["-s", name]),
        }
    }

    fn install(self, names: &[&str]) -> HostCommand {
        match self {
            Self::Rpm => HostCommand::new("dnf").args(["-y", "install"]).args(names.iter().copied()),
            Self::Dpkg => HostCommand::new("apt-get")
                .args(["-y", "install"])
                .args(names.iter().copied()),
        }
    }
}

/// Query `name`, returning the manager that answered and whether it is installed.
fn query(runner: &dyn CommandRunner, name: &str) -> Option<(PackageManager, bool)> {
    for pm in PackageManager::iter() {
        match runner.run(&pm.query(name)) {
            Ok(output) => return Some((pm, output.success())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("{pm} not available");
            }
            Err(e) => {
                warn!("Querying {name} with {pm}: {e}");
            }
        }
    }
    None
}

/// Install any of `names` that are missing.
///
/// Fails with [`ProvisionError::Dependency`] if no package manager is
/// usable or the install command fails.
pub fn ensure_installed(runner: &dyn CommandRunner, names: &[&str]) -> Result<()> {
    let mut missing = Vec::new();
    let mut manager = None;
    for &name in names {
        match query(runner, name) {
            Some((pm, true)) => {
                debug!("Package {name} already installed");
                manager.get_or_insert(pm);
            }
            Some((pm, false)) => {
                missing.push(name);
                manager.get_or_insert(pm);
            }
            None => missing.push(name),
        }
    }
    if missing.is_empty() {
        return Ok(());
    }

    let dependency_error = || ProvisionError::Dependency {
        packages: missing.join(", "),
    };
    let Some(pm) = manager else {
        warn!("No supported package manager found");
        return Err(dependency_error());
    };
    info!("Installing {}", missing.join(", "));
    match runner.run(&pm.install(&missing)) {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => {
            warn!("Package installation failed: {}", output.stderr.trim());
            Err(dependency_error())
        }
        Err(e) => {
            warn!("Package installation failed: {e}");
            Err(dependency_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testutil::FakeRunner;

    #[test]
    fn test_already_installed() {
        let runner = FakeRunner::new();
        ensure_installed(&runner, &[CEPH_CLIENT_PACKAGE]).unwrap();
        assert_eq!(runner.calls(), vec!["rpm -q ceph-common"]);
    }

    #[test]
    fn test_installs_missing_with_dnf() {
        let runner = FakeRunner::new();
        runner.fail("rpm -q", "package ceph-common is not installed");
        ensure_installed(&runner, &[CEPH_CLIENT_PACKAGE]).unwrap();
        assert!(runner.called("dnf -y install ceph-common"));
    }

    #[test]
    fn test_falls_back_to_dpkg() {
        let runner = FakeRunner::new();
        runner.missing("rpm");
        runner.fail("dpkg -s", "not installed");
        ensure_installed(&runner, &[CEPH_CLIENT_PACKAGE]).unwrap();
        assert!(runner.called("apt-get -y install ceph-common"));
    }

    #[test]
    fn test_install_failure_is_dependency_error() {
        let runner = FakeRunner::new();
        runner.fail("rpm -q", "not installed");
        runner.fail("dnf", "No match for argument");
        let err = ensure_installed(&runner, &[CEPH_CLIENT_PACKAGE]).unwrap_err();
        assert!(matches!(err, ProvisionError::Dependency { .. }));
    }

    #[test]
    fn test_no_package_manager() {
        let runner = FakeRunner::new();
        runner.missing("rpm");
        runner.missing("dpkg");
        let err = ensure_installed(&runner, &[CEPH_CLIENT_PACKAGE]).unwrap_err();
        assert!(matches!(err, ProvisionError::Dependency { .. }));
    }
}
