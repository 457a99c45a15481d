//! qemu-img wrappers for creating and converting disk images

use camino::Utf8Path;
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::exec::{run_checked, CommandRunner, HostCommand};

/// Create a blank image of `format` and `size` at `path`.
pub fn create(runner: &dyn CommandRunner, format: &str, path: &Utf8Path, size: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| ProvisionError::io(format!("Creating {parent}"), e))?;
    }
    let cmd = HostCommand::new("qemu-img").args(["create", "-f", format, path.as_str(), size]);
    run_checked(runner, &cmd)?;
    info!("Created {format} image {path} ({size})");
    Ok(())
}

/// Convert `source` into `dest`, which may be a protocol locator such as `rbd:...`.
///
/// `sensitive` values are masked in logs and errors.
pub fn convert(
    runner: &dyn CommandRunner,
    format: &str,
    source: &Utf8Path,
    dest: &str,
    sensitive: Option<&str>,
) -> Result<()> {
    let mut cmd = HostCommand::new("qemu-img").args(["convert", "-O", format, source.as_str(), dest]);
    if let Some(s) = sensitive {
        cmd = cmd.redact(s);
    }
    run_checked(runner, &cmd)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testutil::FakeRunner;

    #[test]
    fn test_create_makes_parent() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap().join("data/vm_test.img");
        let runner = FakeRunner::new();
        create(&runner, "qcow2", &path, "2G").unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(
            runner.calls(),
            vec![format!("qemu-img create -f qcow2 {path} 2G")]
        );
    }

    #[test]
    fn test_convert_failure_masks_key() {
        let runner = FakeRunner::new();
        runner.fail("qemu-img convert", "error connecting: key=SEKRIT rejected");
        let err = convert(
            &runner,
            "raw",
            Utf8Path::new("/tmp/a.img"),
            "rbd:p/i:mon_host=m:id=admin:key=SEKRIT",
            Some("SEKRIT"),
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("qemu-img convert -O raw"));
        assert!(!msg.contains("SEKRIT"));
    }
}
