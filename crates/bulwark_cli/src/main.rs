//! BULWARK CLI
//!
//! Seeded load simulations and configuration checks for the coordination
//! layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use commands::SimulateArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "bulwark=info";

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "BULWARK - resilient query coordination", long_about = None)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a seeded load simulation
    Simulate {
        /// Root seed
        #[arg(short, long, default_value_t = 42)]
        seed: u64,
        /// Requests to issue
        #[arg(short = 'n', long, default_value_t = 500)]
        requests: usize,
        /// Probability that a backend call fails
        #[arg(short, long, default_value_t = 0.05)]
        failure_rate: f64,
        /// Backend outage as START-END in simulated milliseconds
        #[arg(long, value_parser = commands::parse_outage)]
        outage: Vec<bulwark_sim::Outage>,
        /// Coordinator config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default configuration or validate a file
    Config {
        /// Config file to validate
        #[arg(long)]
        validate: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().try_init().map_err(|e| eyre!("{e}"))
    } else {
        builder.try_init().map_err(|e| eyre!("{e}"))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let rendered = match cli.command {
        Commands::Simulate {
            seed,
            requests,
            failure_rate,
            outage,
            config,
            json,
        } => {
            let args = SimulateArgs {
                seed,
                requests,
                failure_rate,
                outages: outage,
                config,
                json,
            };
            commands::simulate(&args).await
        }
        Commands::Config { validate } => commands::config(validate.as_deref()),
    };

    let rendered = rendered.map_err(|e| eyre!("{e:#}"))?;
    println!("{rendered}");
    Ok(())
}
