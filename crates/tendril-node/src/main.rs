use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod config;
mod executor;
mod mempool;
mod network;
mod node;
mod txgen;

use cli::{Cli, Commands};
use config::{generate_devnet_config, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_node(&config).await?;
        }
        Commands::Init {
            output,
            validators,
            data_dir,
            aggregate,
        } => {
            init_config(&output, validators, data_dir, aggregate)?;
        }
        Commands::Keygen { output } => {
            generate_keypair(output)?;
        }
        Commands::Status { endpoint } => {
            show_status(&endpoint).await?;
        }
        Commands::Tx { endpoint, data } => {
            submit_transaction(&endpoint, &data).await?;
        }
    }

    Ok(())
}

/// Run the local validators
async fn run_node(config_path: &Path) -> Result<()> {
    info!("Loading configuration from {:?}", config_path);

    if !config_path.exists() {
        error!(
            "Configuration file not found: {:?}. Run 'tendril init' to create one.",
            config_path
        );
        return Err(anyhow!("Configuration file not found"));
    }
    let config = NodeConfig::load(config_path)?;

    let node = Node::new(config)?;
    node.run().await
}

/// Initialize a new configuration file
fn init_config(output: &Path, validators: usize, data_dir: PathBuf, aggregate: bool) -> Result<()> {
    if validators == 0 {
        return Err(anyhow!("at least one validator is required"));
    }
    let mut config = generate_devnet_config(validators, data_dir);
    config.consensus.use_aggregate_signature = aggregate;
    config.save(output)?;

    info!("Configuration saved to {:?}", output);
    for validator in &config.genesis.validators {
        info!("  {}: {}", validator.name, validator.pub_key);
    }

    println!("\nConfiguration file created: {}", output.display());
    println!("\nTo start the devnet, run:");
    println!("  tendril run --config {}", output.display());

    Ok(())
}

/// Generate a new keypair
fn generate_keypair(output: Option<PathBuf>) -> Result<()> {
    let keypair = tendril_core::KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Address:     {}", keypair.address().to_hex());
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());

    if let Some(path) = output {
        std::fs::write(&path, keypair.secret.to_hex())?;
        info!("Secret key saved to {:?}", path);
    }

    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");

    Ok(())
}

/// Show node status
async fn show_status(endpoint: &str) -> Result<()> {
    let url = format!("{}/status", endpoint);

    let response = reqwest::get(&url).await?;

    if response.status().is_success() {
        let status: tendril_rpc::StatusResponse = response.json().await?;
        println!("Node Status:");
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        error!("Failed to get status: {}", response.status());
    }

    Ok(())
}

/// Submit a transaction
async fn submit_transaction(endpoint: &str, data: &str) -> Result<()> {
    mempool::parse_kv(data.as_bytes())?;
    let url = format!("{}/tx", endpoint);

    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&tendril_rpc::TxSubmitRequest {
            tx: hex::encode(data),
        })
        .send()
        .await?;

    if response.status().is_success() {
        let result: tendril_rpc::TxSubmitResponse = response.json().await?;
        println!("Transaction submitted:");
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let error: serde_json::Value = response.json().await?;
        error!("Failed to submit transaction:");
        println!("{}", serde_json::to_string_pretty(&error)?);
    }

    Ok(())
}
