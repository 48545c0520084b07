use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tendril - BFT consensus devnet
#[derive(Parser)]
#[command(name = "tendril")]
#[command(about = "Tendril node and utilities")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the validators listed in a configuration file
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
    },

    /// Write a devnet configuration with fresh validator keys
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,

        /// Number of validators
        #[arg(short = 'n', long, default_value_t = 4)]
        validators: usize,

        /// Node data directory
        #[arg(long, default_value = "./tendril-data")]
        data_dir: PathBuf,

        /// Use aggregate signature mode
        #[arg(long)]
        aggregate: bool,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file for secret key
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show node status
    Status {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:26657")]
        endpoint: String,
    },

    /// Submit a key=value transaction
    Tx {
        /// RPC endpoint
        #[arg(short, long, default_value = "http://127.0.0.1:26657")]
        endpoint: String,

        /// Transaction as key=value
        data: String,
    },
}
