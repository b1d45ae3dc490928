// SPDX-License-Identifier: AGPL-3.0-or-later
//! rdgate: Remote Desktop Gateway bastion provisioning
//!
//! Synthesizes the gateway deployment and runs its first-boot bootstrap.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rdgate::{
    bootstrap::{self, BootstrapMachine, BootstrapSettings, PowerShellHost},
    config::LoggingConfig,
    provider::{self, DryRunCollaborator},
    Config,
};

/// rdgate: Remote Desktop Gateway bastion provisioning
///
/// Orchestration of the gateway's network, identity, security policy and
/// instance, plus the first-boot bootstrap of its gateway service.
#[derive(Parser, Debug)]
#[command(name = "rdgate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "rdgate.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Dry run mode (nothing is executed or submitted)
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Synthesize the deployment template
    #[command(alias = "synthesize")]
    Synth {
        /// Write the template here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the rendered first-boot script
    Script {
        /// Write the script here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Submit the deployment and print the instance handle
    Deploy,

    /// Run the bootstrap state machine on this gateway
    Bootstrap,

    /// Show configuration
    Config,

    /// Initialize a new rdgate configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging = Config::load_or_default(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(&cli, &logging)?;

    match cli.command {
        Commands::Version => {
            println!("rdgate v{}", env!("CARGO_PKG_VERSION"));
            println!("Remote Desktop Gateway bastion provisioning");
            Ok(())
        }

        Commands::Init { force } => init_config(&cli.config, force),

        Commands::Config => show_config(&cli.config),

        Commands::Synth { output } => synth(&cli.config, output.as_deref()),

        Commands::Script { output } => render_script(&cli.config, output.as_deref()),

        Commands::Deploy => deploy(&cli.config, cli.dry_run).await,

        Commands::Bootstrap => run_bootstrap(&cli.config, cli.dry_run).await,
    }
}

/// Initialize tracing from the CLI flags, falling back to the configured level
fn init_logging(cli: &Cli, logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else if cli.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr);

    match (&logging.file, logging.format.as_str()) {
        (Some(path), format) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let builder = builder.with_ansi(false).with_writer(std::sync::Mutex::new(file));
            if format == "json" {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        (None, "json") => builder.json().init(),
        (None, _) => builder.init(),
    }

    Ok(())
}

fn load_config(config_path: &Path) -> anyhow::Result<Config> {
    Config::load_or_default(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))
}

fn write_or_print(output: Option<&Path>, contents: &str) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, contents)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
            println!("Wrote {}", path.display());
        }
        None => println!("{}", contents),
    }
    Ok(())
}

/// Initialize a new configuration file
fn init_config(config_path: &Path, force: bool) -> anyhow::Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        );
    }

    let default_config = r#"# SPDX-License-Identifier: AGPL-3.0-or-later
# rdgate configuration

name = "RdGateStack"
version = "1.0"

[network]
cidr = "172.16.0.0/16"
subnet_mask = 20
visibility = "public"
availability_zones = 1
nat_gateways = 0

[identity]
role_name = "Role"
trusted_principal = "ec2.amazonaws.com"
capability = "AmazonSSMManagedInstanceCore"

[security]
# Outbound traffic is denied by default. cfn-init fetches the bootstrap
# script and the SSM agent reports in over outbound HTTPS, so deployments
# relying on either must set this to true or add an egress entry for 443.
allow_all_outbound = false

# Deliberately broad: the trusted peer may use every port and protocol.
[[security.trusted_peers]]
peer = "58.96.89.81/32"
ports = "all"
protocol = "all"
description = "Allow all from trusted ip"

[instance]
logical_id = "rdGateway"
machine_class = "t3.small"
image_family = "windows"
image = "WINDOWS_SERVER_2016_ENGLISH_FULL_BASE"

[bootstrap]
# The certificate is exported to $HOME\Desktop and the CAP/RAP admit
# administrators@BUILTIN and Remote Desktop Users@BUILTIN; both are fixed.
dns_name = "yourvmname.eastus.cloudapp.azure.com"
powershell = "powershell.exe"
step_timeout_secs = 120

[logging]
level = "info"
format = "text"
# file = "C:\\ProgramData\\rdgate\\rdgate.log"
"#;

    std::fs::write(config_path, default_config)?;
    info!("Created configuration file: {}", config_path.display());
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

/// Show the current configuration
fn show_config(config_path: &Path) -> anyhow::Result<()> {
    if !config_path.exists() {
        println!("No configuration file found. Using defaults:");
        println!();
        println!("{}", toml::to_string_pretty(&Config::default())?);
        return Ok(());
    }

    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

/// Synthesize and print the deployment template
fn synth(config_path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let descriptor = rdgate::synthesize_from_config(&config).context("Synthesis failed")?;
    let template = serde_json::to_string_pretty(&descriptor.to_template())?;
    write_or_print(output, &template)
}

/// Print the rendered bootstrap script
fn render_script(config_path: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let payload = bootstrap::compose_payload(&config.bootstrap.dns_name)
        .context("Failed to render bootstrap script")?;
    write_or_print(output, payload.body())
}

/// Synthesize, submit and report the instance handle
async fn deploy(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    // Synthesis errors surface before anything is submitted
    let descriptor = rdgate::synthesize_from_config(&config).context("Synthesis failed")?;

    if !dry_run {
        anyhow::bail!(
            "No provisioning collaborator is configured for stack '{}'. \
             Use `rdgate synth` to produce the template, or rerun with --dry-run.",
            descriptor.stack_name
        );
    }

    println!("[DRY RUN] Would deploy stack: {}", descriptor.stack_name);
    let deployment = provider::deploy(&DryRunCollaborator, &descriptor).await?;

    println!();
    println!("Resources:");
    for resource in &descriptor.resources {
        println!(
            "  {} ({}): {}",
            resource.logical_id,
            resource.kind.resource_type(),
            deployment
                .provisioned
                .physical_id(&resource.logical_id)
                .unwrap_or("-")
        );
    }

    println!();
    println!("Outputs:");
    for (name, value) in &deployment.outputs {
        println!("  {} = {}", name, value);
    }

    Ok(())
}

/// Run the bootstrap state machine against the local gateway
async fn run_bootstrap(config_path: &Path, dry_run: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let settings = BootstrapSettings::for_dns_name(&config.bootstrap.dns_name);
    let machine = BootstrapMachine::new(settings).context("Invalid bootstrap settings")?;
    let host = PowerShellHost::new(
        &config.bootstrap.powershell,
        config.bootstrap.step_timeout_secs,
        dry_run,
    );

    if dry_run {
        println!("[DRY RUN] Would bootstrap gateway: {}", config.bootstrap.dns_name);
    } else {
        println!("Bootstrapping gateway: {}", config.bootstrap.dns_name);
    }

    let report = machine.run(&host).await;

    println!();
    for step in &report.steps {
        match (&step.error, &step.warning) {
            (Some(e), _) => println!("  [failed] {}: {}", step.state, e),
            (None, Some(w)) => println!("  [warn]   {}: {}", step.state, w),
            (None, None) => println!("  [ok]     {} ({} ms)", step.state, step.duration_ms),
        }
    }

    println!();
    if let Some(certificate) = &report.certificate {
        println!("Certificate thumbprint: {}", certificate.thumbprint);
        if let Some(path) = &certificate.exported_path {
            println!("Exported certificate: {}", path);
        }
    }
    if let Some(profile) = &report.connection_profile {
        println!("Connection authorization: {}", profile.name);
    }
    if let Some(profile) = &report.resource_profile {
        println!("Resource authorization: {}", profile.name);
    }
    println!("Duration: {} ms", report.total_duration_ms);

    match report.into_result() {
        Ok(_) => {
            println!("Bootstrap completed successfully");
            Ok(())
        }
        Err(e) => {
            println!("Bootstrap halted; the gateway keeps its previous configuration");
            error!(error = %e, "Bootstrap failed");
            std::process::exit(1);
        }
    }
}
