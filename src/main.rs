// Host Fault Agent - Main Entry Point
//
// - `host-fault-agent [run]`: serve the action and health endpoints
// - `host-fault-agent memfill`: memory allocator child of the fill-mem action
// - `host-fault-agent describe`: print all action descriptors as JSON

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use host_fault_agent::config::AgentConfig;
use host_fault_agent::fill::{allocator, MemFillMode, MemFillPlan, MemUnit};
use host_fault_agent::{agent, logging};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Host Fault Agent: reversible fault injection on Linux hosts
#[derive(Parser, Debug)]
#[command(name = "host-fault-agent")]
#[command(version)]
#[command(about = "Reversible CPU, memory, disk, network, clock, process and power faults", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Allocate and hold memory, used by the fill-mem action
    Memfill {
        #[arg(long, value_enum)]
        mode: MemFillMode,
        #[arg(long, value_enum)]
        unit: MemUnit,
        /// Megabytes or percent of total memory
        #[arg(long)]
        size: u64,
        /// Seconds to hold the memory
        #[arg(long)]
        duration: u64,
    },
    /// Print every action descriptor as JSON
    Describe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref())?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            logging::init(&config.logging, args.verbose)?;
            info!(
                "Host fault agent v{} starting...",
                env!("CARGO_PKG_VERSION")
            );
            agent::run(config).await?;
        }
        Commands::Memfill {
            mode,
            unit,
            size,
            duration,
        } => {
            logging::init(&config.logging, args.verbose)?;
            allocator::run(MemFillPlan {
                mode,
                unit,
                size,
                duration: Duration::from_secs(duration),
                proc_root: config.tools.proc_root.clone(),
            })
            .await?;
        }
        Commands::Describe => {
            let descriptions = agent::describe_all(&config)?;
            let json = serde_json::to_string_pretty(&descriptions)
                .context("Failed to render action descriptors")?;
            println!("{}", json);
        }
    }

    Ok(())
}
