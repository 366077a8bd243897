// gattlink: command-line front end
//
// Runs a loopback GATT session, prints service shapes and manages the
// configuration file.

mod config;
mod demo;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use gattlink_core::GattLinkConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gattlink")]
#[command(about = "gattlink: BLE GATT central and peripheral sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a central and a peripheral over the in-memory radio
    Demo {
        /// Number of counter writes to perform
        #[arg(short, long, default_value = "3")]
        writes: u32,
    },
    /// Print the demo peripheral's service descriptors as JSON
    Describe,
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = config::resolve(cli.config.as_deref())?;
    let settings = config::load_from(&path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .init();

    match cli.command {
        Commands::Demo { writes } => demo::run(settings, writes).await,
        Commands::Describe => cmd_describe(),
        Commands::Config { action } => cmd_config(action, &path, settings),
    }
}

fn cmd_describe() -> Result<()> {
    let registry = demo::counter_registry()?;
    let json = serde_json::to_string_pretty(&registry.service_descriptors())
        .context("Failed to serialize service descriptors")?;
    println!("{}", json);
    Ok(())
}

fn cmd_config(action: ConfigAction, path: &std::path::Path, settings: GattLinkConfig) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{} {}", "Config file:".bold(), path.display());
            if !path.exists() {
                println!("  {}", "(not created, showing defaults)".dimmed());
            }
            println!("{}", settings.to_json().context("Failed to serialize config")?);
        }

        ConfigAction::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file {} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            config::save_to(&GattLinkConfig::default(), path)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
    }

    Ok(())
}
