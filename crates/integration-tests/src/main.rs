use std::path::Path;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod ceph_disk;
    pub mod cli;
}

/// Monitor address for trials that need a live Ceph cluster
pub(crate) const TEST_MON_ENV: &str = "RBDKIT_TEST_MON";
/// Libvirt domain for trials that attach a disk
pub(crate) const TEST_VM_ENV: &str = "RBDKIT_TEST_VM";

/// Get the path to the rbdkit binary, checking RBDKIT_PATH env var first, then falling back to "rbdkit"
pub(crate) fn get_rbdkit_command() -> Result<String> {
    if let Ok(path) = std::env::var("RBDKIT_PATH") {
        return Ok(path);
    }
    // Force the user to set this if we're running from the project dir
    if let Some(path) = ["target/debug/rbdkit", "target/release/rbdkit"]
        .into_iter()
        .find(|p| Path::new(p).exists())
    {
        return Err(eyre!(
            "Detected {path} - set RBDKIT_PATH={path} to run using this binary"
        ));
    }
    Ok("rbdkit".to_owned())
}

/// Whether a live cluster and domain were provided through the environment.
fn have_ceph_env() -> bool {
    [TEST_MON_ENV, TEST_VM_ENV]
        .iter()
        .all(|v| std::env::var_os(v).is_some_and(|s| !s.is_empty()))
}

fn main() {
    let args = Arguments::from_args();
    let no_ceph = !have_ceph_env();

    let tests = vec![
        Trial::test("help_lists_subcommands", || {
            tests::cli::test_help_lists_subcommands();
            Ok(())
        }),
        Trial::test("run_requires_is_setup", || {
            tests::cli::test_run_requires_is_setup();
            Ok(())
        }),
        Trial::test("config_json", || {
            tests::cli::test_config_json()?;
            Ok(())
        }),
        Trial::test("config_params_file_override", || {
            tests::cli::test_config_params_file_override()?;
            Ok(())
        }),
        Trial::test("config_rejects_malformed_disk_name", || {
            tests::cli::test_config_rejects_malformed_disk_name();
            Ok(())
        }),
        Trial::test("disk_xml_plain", || {
            tests::cli::test_disk_xml_plain();
            Ok(())
        }),
        Trial::test("disk_xml_auth", || {
            tests::cli::test_disk_xml_auth();
            Ok(())
        }),
        Trial::test("setup_rejects_malformed_disk_name", || {
            tests::cli::test_setup_rejects_malformed_disk_name()?;
            Ok(())
        }),
        Trial::test("ceph_cold_plug_lifecycle", || {
            tests::ceph_disk::test_cold_plug_lifecycle()?;
            Ok(())
        })
        .with_ignored_flag(no_ceph),
        Trial::test("ceph_keep_raw_image", || {
            tests::ceph_disk::test_keep_raw_image()?;
            Ok(())
        })
        .with_ignored_flag(no_ceph),
    ];

    libtest_mimic::run(&args, tests).exit();
}
