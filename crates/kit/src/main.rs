use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod ceph;
mod commands;
mod config;
mod disk;
mod domain;
mod error;
mod exec;
mod package;
mod params;
mod provision;
mod qemu_img;
mod record;
mod secret;
mod virsh;

/// Attach Ceph RBD disks to libvirt domains for the duration of a test.
///
/// rbdkit prepares Ceph credentials, creates the remote image from a local
/// one, and hands the disk to a domain either live or through its
/// persistent definition. Everything it creates is recorded in a state file
/// so teardown can release it again.
#[derive(Parser)]
#[clap(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available rbdkit commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the remote image and attach it to a domain
    ///
    /// Installs ceph-common if needed, writes the keyring and registers a
    /// libvirt secret when credentials are given, replaces any existing
    /// remote image of the same name, and attaches the disk.
    Setup(commands::ProvisionOpts),

    /// Remove the remote image, local scratch files and the auth secret
    Teardown(commands::ProvisionOpts),

    /// Set up or tear down depending on --is-setup
    Run(commands::RunOpts),

    /// Show the configuration resolved from the given parameters
    Config(commands::ConfigOpts),

    /// Print the disk XML that setup would attach
    #[clap(name = "disk-xml")]
    DiskXml(commands::DiskXmlOpts),
}

/// Install and configure the tracing/logging system.
///
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info',
/// and written to stderr so command output stays clean.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup(opts) => commands::setup(opts)?,
        Commands::Teardown(opts) => commands::teardown(opts)?,
        Commands::Run(opts) => commands::run(opts)?,
        Commands::Config(opts) => commands::show_config(opts)?,
        Commands::DiskXml(opts) => commands::disk_xml(opts)?,
    }
    Ok(())
}
