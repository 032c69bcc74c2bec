//! Meshwork agent
//!
//! Joins this device to its workgroup mesh: negotiates direct tunnels to
//! the other devices, brings up the encrypted overlay network, and relays
//! service traffic in both directions.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod agent;
mod config;
mod directory;

use agent::MeshAgent;
use config::AgentConfig;
use directory::{DeviceDirectory, DeviceStatus, FileDirectory};
use meshwork_tasks::ShutdownToken;

/// Meshwork - workgroup mesh networking agent
#[derive(Parser)]
#[command(name = "meshwork")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "meshwork.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent
    Start,

    /// Show the mesh as derived from the current directory snapshot
    Status,

    /// Write a default config and generate a key seed
    Init {
        /// Overwrite existing files
        #[arg(short, long)]
        force: bool,

        /// This device's directory authority
        #[arg(short, long)]
        authority: String,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    match cli.command {
        Commands::Start => start(&cli.config).await,
        Commands::Status => status(&cli.config).await,
        Commands::Init { force, authority } => init(&cli.config, force, &authority),
        Commands::Config => {
            let config = AgentConfig::load(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn start(config_path: &PathBuf) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    if config.authority.is_empty() {
        anyhow::bail!("config has no authority; run `meshwork init` first");
    }
    let seed = config::load_seed(&config.key_file)?;
    let directory: Arc<dyn DeviceDirectory> =
        Arc::new(FileDirectory::new(config.directory_path.clone()));

    let token = ShutdownToken::new();
    let agent = MeshAgent::new(config, seed, directory, token.clone())?;
    info!(
        overlay_key = %agent.overlay_public_key(),
        "agent identity ready"
    );

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    agent.run().await
}

async fn status(config_path: &PathBuf) -> Result<()> {
    let config = AgentConfig::load(config_path)?;
    let directory = FileDirectory::new(config.directory_path.clone());
    let records = directory.snapshot().await?;

    println!(
        "{:<18} {:<44} {:<16} {:<14} {}",
        "HOSTNAME", "AUTHORITY", "MESH ADDRESS", "PROXY ALIAS", "KEY"
    );
    for (index, record) in records.iter().enumerate() {
        if record.status == DeviceStatus::Deleted {
            continue;
        }
        let key_state = match record.overlay_key.as_deref() {
            Some(_) => "published",
            None => "unresolved",
        };
        let marker = if record.authority == config.authority {
            " (this device)"
        } else {
            ""
        };
        println!(
            "{:<18} {:<44} {:<16} {:<14} {}{}",
            record.hostname,
            record.authority,
            meshwork_overlay::overlay_address(index),
            meshwork_overlay::loopback_alias(index),
            key_state,
            marker,
        );
    }
    Ok(())
}

fn init(config_path: &PathBuf, force: bool, authority: &str) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; use --force to overwrite",
            config_path.display()
        );
    }

    let mut config = AgentConfig::default();
    config.authority = authority.to_string();
    config.save(config_path)?;

    if config.key_file.exists() && !force {
        warn!(
            "key file {} already exists, keeping it",
            config.key_file.display()
        );
    } else {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        config::write_seed(&config.key_file, &seed)?;
        info!("generated key seed at {}", config.key_file.display());
    }

    info!("wrote config to {}", config_path.display());
    Ok(())
}
