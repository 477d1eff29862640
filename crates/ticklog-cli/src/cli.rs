use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-asset order-book logger and chart-view aggregation service.
#[derive(Debug, Parser)]
#[command(name = "ticklog", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the sampling pipelines for every configured asset until
    /// interrupted.
    Run {
        /// Path to the JSON pipeline configuration.
        #[arg(long)]
        config: PathBuf,
    },

    /// Rebuild one asset's derived views from its partitions and exit.
    Rebuild {
        /// Path to the JSON pipeline configuration.
        #[arg(long)]
        config: PathBuf,

        /// Asset pair to rebuild, e.g. ADA-USD.
        #[arg(long)]
        pair: String,
    },

    /// List the configured assets and their validated settings.
    Assets {
        /// Path to the JSON pipeline configuration.
        #[arg(long)]
        config: PathBuf,
    },
}
