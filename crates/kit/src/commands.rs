//! CLI front-ends for the provisioning flows
//!
//! Setup persists the [`ProvisionRecord`] to a state file even when it
//! fails, so a later teardown can release partially created resources.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use comfy_table::Table;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::ProvisioningConfig;
use crate::disk::DiskBuilder;
use crate::exec::{CommandRunner, HostRunner};
use crate::params::ParamOpts;
use crate::provision::{create_scratch_dir, prune_scratch_dirs, DiskProvisioner};
use crate::record::ProvisionRecord;
use crate::secret::SecretId;

/// Options shared by setup, teardown and run
#[derive(Debug, Parser)]
pub struct ProvisionOpts {
    /// Name of the libvirt domain receiving the disk
    pub vm_name: String,

    #[clap(flatten)]
    pub params: ParamOpts,

    /// Where to keep the record of created resources
    /// (default: <tmp_dir>/<vm>.rbdkit-state.json)
    #[clap(long)]
    pub state_file: Option<Utf8PathBuf>,
}

/// Unified entry point selecting setup or teardown
#[derive(Debug, Parser)]
pub struct RunOpts {
    #[clap(flatten)]
    pub provision: ProvisionOpts,

    /// Set up the disk (true) or tear it down (false)
    #[clap(long, action = clap::ArgAction::Set, value_name = "BOOL")]
    pub is_setup: bool,
}

/// Print the resolved configuration
#[derive(Debug, Parser)]
pub struct ConfigOpts {
    #[clap(flatten)]
    pub params: ParamOpts,

    /// Output as JSON
    #[clap(long)]
    pub json: bool,
}

/// Print the disk XML setup would attach, without touching the host
#[derive(Debug, Parser)]
pub struct DiskXmlOpts {
    #[clap(flatten)]
    pub params: ParamOpts,

    /// Secret UUID to reference in the <auth> element (auth case only)
    #[clap(long)]
    pub secret_uuid: Option<SecretId>,
}

pub fn run(opts: RunOpts) -> Result<()> {
    execute(&HostRunner, opts.provision, opts.is_setup)
}

pub fn setup(opts: ProvisionOpts) -> Result<()> {
    execute(&HostRunner, opts, true)
}

pub fn teardown(opts: ProvisionOpts) -> Result<()> {
    execute(&HostRunner, opts, false)
}

fn execute(runner: &dyn CommandRunner, opts: ProvisionOpts, is_setup: bool) -> Result<()> {
    let params = opts.params.load()?;
    let cfg = ProvisioningConfig::from_params(&params)?;
    let vm_name = opts.vm_name.as_str();
    let state_file = opts
        .state_file
        .clone()
        .unwrap_or_else(|| ProvisionRecord::default_path(&cfg, vm_name));

    // A repeated setup keeps filling the record of the earlier one
    let mut record = match ProvisionRecord::load_optional(&state_file)? {
        Some(record) if record.vm_name != vm_name => {
            return Err(eyre!(
                "State file {state_file} belongs to {}, not {vm_name}",
                record.vm_name
            ));
        }
        Some(record) => record,
        None if is_setup => ProvisionRecord::new(vm_name),
        None => ProvisionRecord::reconstruct(vm_name, &cfg),
    };

    if is_setup {
        if let Some(dir) = state_file.parent().filter(|d| !d.as_str().is_empty()) {
            create_scratch_dir(dir, &mut record)?;
        }
    }
    let result = DiskProvisioner::new(runner).run(vm_name, &params, is_setup, &mut record);

    if is_setup {
        record.save(&state_file)?;
        if let Err(e) = result {
            warn!("Setup failed; run teardown with state file {state_file} to clean up");
            return Err(e).wrap_err_with(|| format!("Setting up RBD disk for {vm_name}"));
        }
        info!("Disk {} ready for {vm_name}", cfg.disk_name);
    } else {
        if let Err(e) = result {
            if !record.is_empty() {
                record.save(&state_file)?;
            }
            return Err(e).wrap_err_with(|| format!("Tearing down RBD disk for {vm_name}"));
        }
        if state_file.exists() {
            std::fs::remove_file(&state_file).with_context(|| format!("Removing {state_file}"))?;
        }
        // The state file may have been the last thing in a scratch directory
        prune_scratch_dirs(&mut record)?;
        info!("Released RBD disk {} of {vm_name}", cfg.disk_name);
    }
    Ok(())
}

pub fn show_config(opts: ConfigOpts) -> Result<()> {
    let params = opts.params.load()?;
    let cfg = ProvisioningConfig::from_params(&params)?;
    let summary = cfg.summary();
    if opts.json {
        let obj: Map<String, Value> = summary
            .into_iter()
            .map(|(k, v)| (k.to_string(), Value::String(v)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&obj)?);
    } else {
        let mut table = Table::new();
        table.set_header(vec!["PARAMETER", "VALUE"]);
        for (k, v) in summary {
            table.add_row(vec![k.to_string(), v]);
        }
        println!("{table}");
    }
    Ok(())
}

pub fn disk_xml(opts: DiskXmlOpts) -> Result<()> {
    let params = opts.params.load()?;
    let cfg = ProvisioningConfig::from_params(&params)?;
    if cfg.is_auth_case() && opts.secret_uuid.is_none() {
        warn!("Credentials configured but no --secret-uuid given; omitting <auth>");
    }
    let xml = DiskBuilder::from_config(&cfg, opts.secret_uuid).build_xml()?;
    println!("{xml}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testutil::FakeRunner;
    use camino::Utf8Path;
    use indoc::indoc;
    use tempfile::TempDir;

    const UUID: &str = "3b1a9f4e-7f52-4a0e-9c2c-8a4c1b5d6e7f";
    const DOMAIN: &str = indoc! {r#"
        <domain type="kvm">
          <name>vm1</name>
          <devices>
          </devices>
        </domain>
    "#};

    struct StateFixture {
        _td: TempDir,
        root: Utf8PathBuf,
        runner: FakeRunner,
    }

    impl StateFixture {
        fn new() -> Self {
            let td = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
            let runner = FakeRunner::new();
            runner.fail("info pool/", "rbd: error opening image: (2) No such file or directory");
            runner.creates_file("qemu-img create", 3);
            runner.succeed("secret-define", &format!("Secret {UUID} created\n"));
            runner.succeed("dumpxml", DOMAIN);
            Self {
                _td: td,
                root,
                runner,
            }
        }

        fn opts(&self, vm_name: &str, disk_name: &str) -> ProvisionOpts {
            let params = [
                ("ceph_mon_ip", "10.0.0.1".to_string()),
                ("ceph_disk_name", disk_name.to_string()),
                ("ceph_client_name", "client.admin".to_string()),
                ("ceph_client_key", "AQBxyzKEY==".to_string()),
                ("tmp_dir", self.root.join("tmp").to_string()),
                ("data_dir", self.root.join("data").to_string()),
                ("ceph_conf_dir", self.root.join("ceph").to_string()),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
            ProvisionOpts {
                vm_name: vm_name.to_string(),
                params: ParamOpts {
                    params_file: None,
                    params,
                },
                state_file: None,
            }
        }

        fn setup(&self) -> Result<()> {
            execute(&self.runner, self.opts("vm1", "pool/img"), true)
        }

        fn teardown(&self) -> Result<()> {
            execute(&self.runner, self.opts("vm1", "pool/img"), false)
        }

        fn state_file(&self) -> Utf8PathBuf {
            self.root.join("tmp/vm1.rbdkit-state.json")
        }

        fn state(&self) -> ProvisionRecord {
            ProvisionRecord::load(&self.state_file()).unwrap()
        }

        fn leftovers(&self) -> Vec<Utf8PathBuf> {
            self.root
                .read_dir_utf8()
                .unwrap()
                .map(|e| e.unwrap().path().to_owned())
                .collect()
        }

        fn position(&self, pattern: &str, nth: usize) -> usize {
            self.runner
                .calls()
                .iter()
                .enumerate()
                .filter(|(_, c)| c.contains(pattern))
                .map(|(i, _)| i)
                .nth(nth)
                .unwrap()
        }
    }

    #[test]
    fn test_teardown_consumes_state_file() {
        let fx = StateFixture::new();
        fx.setup().unwrap();
        let state = fx.state();
        assert_eq!(state.secret.unwrap().to_string(), UUID);
        assert!(state.cluster_config.is_some());

        fx.teardown().unwrap();
        assert!(fx.runner.called(&format!("virsh secret-undefine {UUID}")));
        assert!(!fx.state_file().exists());
        assert_eq!(fx.leftovers(), Vec::<Utf8PathBuf>::new());
    }

    #[test]
    fn test_failed_setup_keeps_state() {
        let fx = StateFixture::new();
        fx.runner.fail("qemu-img convert", "error connecting");
        assert!(fx.setup().is_err());
        let state = fx.state();
        assert_eq!(state.secret.unwrap().to_string(), UUID);
        assert_eq!(state.remote_image.unwrap().to_string(), "pool/img");

        fx.teardown().unwrap();
        assert!(fx.runner.called("secret-undefine"));
        assert_eq!(fx.leftovers(), Vec::<Utf8PathBuf>::new());
    }

    #[test]
    fn test_setup_twice_keeps_ownership() {
        let fx = StateFixture::new();
        fx.setup().unwrap();
        fx.setup().unwrap();

        // The first secret is released before a new one is defined
        let undefine = fx.position("secret-undefine", 0);
        assert!(fx.position("secret-define", 0) < undefine);
        assert!(undefine < fx.position("secret-define", 1));
        let state = fx.state();
        assert!(state.cluster_config.is_some());
        assert!(state.local_image.is_some());
        assert!(state.secret.is_some());

        fx.teardown().unwrap();
        assert_eq!(fx.runner.count("secret-undefine"), 2);
        assert_eq!(fx.leftovers(), Vec::<Utf8PathBuf>::new());
    }

    #[test]
    fn test_setup_with_conflicting_state_refused() {
        let fx = StateFixture::new();
        fx.setup().unwrap();
        let calls = fx.runner.calls().len();

        let err = execute(&fx.runner, fx.opts("vm1", "pool/other"), true).unwrap_err();
        assert!(format!("{err:#}").contains("run teardown first"));
        assert_eq!(fx.runner.calls().len(), calls);
        assert_eq!(fx.state().remote_image.unwrap().to_string(), "pool/img");
    }

    #[test]
    fn test_state_file_of_other_domain_rejected() {
        let fx = StateFixture::new();
        let shared = fx.root.join("shared.json");
        let mut opts = fx.opts("vm1", "pool/img");
        opts.state_file = Some(shared.clone());
        execute(&fx.runner, opts, true).unwrap();

        let mut opts = fx.opts("vm2", "pool/img");
        opts.state_file = Some(shared.clone());
        let err = execute(&fx.runner, opts, false).unwrap_err();
        assert!(err.to_string().contains("belongs to vm1"));
        assert!(!fx.runner.called("secret-undefine"));
        assert_eq!(ProvisionRecord::load(&shared).unwrap().vm_name, "vm1");
    }

    #[test]
    fn test_failed_teardown_saves_remaining_state() {
        let fx = StateFixture::new();
        fx.setup().unwrap();
        fx.runner
            .fail("secret-undefine", "error: failed to connect to the hypervisor");

        assert!(fx.teardown().is_err());
        let state = fx.state();
        assert_eq!(state.secret.unwrap().to_string(), UUID);
        assert_eq!(state.key_file, None);
        assert_eq!(state.remote_image, None);
        assert_eq!(state.local_image, None);
    }
}
