//! Integration tests for the rbdkit command line surface
//!
//! None of these touch Ceph or libvirt: they cover argument handling,
//! parameter resolution and the disk XML rendering.

use std::process::{Command, Output};

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use serde_json::Value;

use crate::get_rbdkit_command;

fn rbdkit(args: &[&str]) -> Output {
    let rbdkit = get_rbdkit_command().unwrap();
    Command::new(&rbdkit)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rbdkit {}: {e}", args.join(" ")))
}

fn stdout_of(args: &[&str]) -> String {
    let output = rbdkit(args);
    assert!(
        output.status.success(),
        "rbdkit {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Test that the top-level help names every subcommand
pub fn test_help_lists_subcommands() {
    let stdout = stdout_of(&["--help"]);
    for sub in ["setup", "teardown", "run", "config", "disk-xml"] {
        assert!(stdout.contains(sub), "Missing '{sub}' subcommand in help");
    }
    println!("rbdkit help output validated");
}

/// Test that run refuses to guess between setup and teardown
pub fn test_run_requires_is_setup() {
    let output = rbdkit(&["run", "vm1", "-p", "ceph_disk_name=rbd/a"]);
    assert!(!output.status.success(), "run without --is-setup succeeded");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--is-setup"), "Unexpected error: {stderr}");
}

/// Test the JSON form of the resolved configuration
pub fn test_config_json() -> Result<()> {
    let stdout = stdout_of(&[
        "config",
        "--json",
        "-p",
        "ceph_disk_name=rbd/test.img",
        "-p",
        "ceph_mon_ip=10.0.0.1,10.0.0.2",
        "-p",
        "ceph_host_port=6789",
        "-p",
        "ceph_client_name=client.admin",
        "-p",
        "ceph_client_key=AQBsecret==",
    ]);
    let config: Value = serde_json::from_str(&stdout).context("Failed to parse JSON output")?;
    let field = |k: &str| {
        config
            .get(k)
            .and_then(Value::as_str)
            .ok_or_else(|| eyre!("Missing {k} in {stdout}"))
    };
    assert_eq!(field("disk_name")?, "rbd/test.img");
    assert_eq!(field("hosts")?, "10.0.0.1:6789,10.0.0.2:6789");
    assert_eq!(field("auth")?, "yes");
    assert_eq!(field("device_target")?, "vdb");
    assert!(
        !stdout.contains("AQBsecret"),
        "Client key leaked into config output"
    );
    Ok(())
}

/// Test that -p assignments override the params file
pub fn test_config_params_file_override() -> Result<()> {
    let td = tempfile::tempdir()?;
    let path = td.path().join("params.json");
    std::fs::write(
        &path,
        r#"{"ceph_disk_name": "rbd/from-file", "virt_disk_device_target": "vdc", "virt_disk_device_hotplug": "yes"}"#,
    )?;
    let path = path.to_str().ok_or_else(|| eyre!("non-UTF-8 tempdir"))?;
    let stdout = stdout_of(&[
        "config",
        "--json",
        "--params-file",
        path,
        "-p",
        "ceph_disk_name=rbd/from-cli",
    ]);
    let config: Value = serde_json::from_str(&stdout)?;
    assert_eq!(config["disk_name"], "rbd/from-cli");
    assert_eq!(config["device_target"], "vdc");
    assert_eq!(config["hotplug"], "yes");
    Ok(())
}

/// Test that a disk name without a pool is refused
pub fn test_config_rejects_malformed_disk_name() {
    for name in ["noslash", "a/b/c", "/img", "pool/"] {
        let arg = format!("ceph_disk_name={name}");
        let output = rbdkit(&["config", "-p", &arg]);
        assert!(!output.status.success(), "Accepted disk name {name}");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("pool/image"),
            "Unexpected error for {name}: {stderr}"
        );
    }
}

/// Test the disk XML without credentials
pub fn test_disk_xml_plain() {
    let stdout = stdout_of(&[
        "disk-xml",
        "-p",
        "ceph_disk_name=rbd/test.img",
        "-p",
        "ceph_mon_ip=mon1",
        "-p",
        "ceph_host_port=6789",
        "-p",
        "virt_disk_device_format=qcow2",
    ]);
    assert!(stdout.contains(r#"<disk type="network" device="disk">"#));
    assert!(stdout.contains(r#"<driver name="qemu" type="qcow2"/>"#));
    assert!(stdout.contains(r#"<source protocol="rbd" name="rbd/test.img">"#));
    assert!(stdout.contains(r#"<host name="mon1" port="6789"/>"#));
    assert!(stdout.contains(r#"<target dev="vdb" bus="virtio"/>"#));
    assert!(!stdout.contains("<auth"), "Unexpected <auth> element");
}

/// Test the disk XML referencing a libvirt secret
pub fn test_disk_xml_auth() {
    let uuid = uuid::Uuid::new_v4().to_string();
    let stdout = stdout_of(&[
        "disk-xml",
        "-p",
        "ceph_disk_name=rbd/test.img",
        "-p",
        "ceph_mon_ip=mon1",
        "-p",
        "ceph_client_name=client.admin",
        "-p",
        "ceph_client_key=AQBsecret==",
        "-p",
        "ceph_auth_user=admin",
        "--secret-uuid",
        &uuid,
    ]);
    assert!(stdout.contains(r#"<auth username="admin">"#));
    assert!(stdout.contains(&format!(r#"<secret type="ceph" uuid="{uuid}"/>"#)));
    assert!(!stdout.contains("AQBsecret"), "Key leaked into disk XML");
}

/// Test that setup fails on configuration before running anything
pub fn test_setup_rejects_malformed_disk_name() -> Result<()> {
    let td = tempfile::tempdir()?;
    let tmp = td.path().to_str().ok_or_else(|| eyre!("non-UTF-8 tempdir"))?;
    let tmp_arg = format!("tmp_dir={tmp}");
    let output = rbdkit(&[
        "setup",
        "vm1",
        "-p",
        "ceph_disk_name=noslash",
        "-p",
        &tmp_arg,
    ]);
    assert!(!output.status.success(), "setup accepted a malformed name");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("pool/image"), "Unexpected error: {stderr}");
    assert!(
        std::fs::read_dir(td.path())?.next().is_none(),
        "setup left files behind after a configuration error"
    );
    Ok(())
}
