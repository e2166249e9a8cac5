use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pve_builder::{builder::Builder, config::Config, multistep::ConsoleUi};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pve-builder", version)]
#[command(about = "Builds Proxmox VE virtual machine images from an ISO", long_about = None)]
struct Cli {
    /// Path to the build configuration file
    #[arg(long, default_value = "pve-builder.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the build: connect, fetch the ISO and upload it to Proxmox storage
    Build {
        /// Print the resulting artifact as JSON
        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Check the configuration without contacting Proxmox
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            config.prepare()?;
            println!("Configuration {} is valid", cli.config.display());
        }
        Commands::Build { json } => {
            let builder = Builder::new(config)?;
            let artifact = builder.run(Arc::new(ConsoleUi)).await?;
            if json {
                let output = serde_json::to_string_pretty(&artifact)
                    .context("Failed to serialize artifact")?;
                println!("{}", output);
            } else {
                println!(
                    "Build finished: ISO {} available on node {}",
                    artifact.iso_file, artifact.node
                );
            }
        }
    }

    Ok(())
}
