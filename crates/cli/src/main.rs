//! Power Pipeline Controller CLI
//!
//! A command-line tool for deploying sensor-to-estimation pipelines and
//! inspecting their health through the controller's API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{deploy, status};
use std::path::PathBuf;

/// Power Pipeline Controller CLI
#[derive(Parser)]
#[command(name = "ppc")]
#[command(author, version, about = "CLI for the Power Pipeline Controller", long_about = None)]
pub struct Cli {
    /// Controller API URL (can also be set via PPC_API_URL env var)
    #[arg(long, env = "PPC_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Deploy the pipeline from configuration files
    Deploy {
        /// Path to the collector configuration JSON
        #[arg(long)]
        collector: PathBuf,

        /// Path to the estimation service configuration JSON
        #[arg(long)]
        estimation: PathBuf,

        /// Node to supervise (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Tear the pipeline down
    Undeploy,

    /// Show aggregate pipeline status and per-component detail
    Status {
        /// Also list per-node fleet detail
        #[arg(long)]
        nodes: bool,
    },
}

async fn run(cli: Cli) -> Result<i32> {
    let client = client::ApiClient::new(&cli.api_url)?;

    match cli.command {
        Commands::Deploy {
            collector,
            estimation,
            nodes,
        } => {
            deploy::deploy(&client, &collector, &estimation, nodes, cli.format).await?;
            Ok(0)
        }
        Commands::Undeploy => {
            deploy::undeploy(&client, cli.format).await?;
            Ok(0)
        }
        Commands::Status { nodes } => status::show_status(&client, nodes, cli.format).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            // Internal errors are distinguishable from a not-ready pipeline
            2
        }
    };

    std::process::exit(code);
}
