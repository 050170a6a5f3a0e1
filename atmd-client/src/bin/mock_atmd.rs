//! Stand-alone fake ATMD server for trying out clients without hardware.
//!
//! Run `mock_atmd --agents 2` and point `atmd_tool --host 127.0.0.1` at it.

use anyhow::{Context, Result};
use atmd_client::mock::{DeviceState, MockDevice};
use atmd_client::{Agent, TimeString, DEFAULT_PORT};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Fake ATMD measurement server
#[derive(Parser, Debug)]
#[command(name = "mock_atmd")]
#[command(about = "Serve the ATMD protocol from an in-memory board")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value_t = format!("127.0.0.1:{DEFAULT_PORT}"))]
    bind: String,

    /// Number of fake network agents to report
    #[arg(long, default_value = "1")]
    agents: u32,

    /// Emit an unrecognised line before every reply
    #[arg(long)]
    noisy: bool,

    /// Initial total measurement time
    #[arg(long, default_value = "10s")]
    total_time: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let state = DeviceState {
        total_time: args
            .total_time
            .parse::<TimeString>()
            .with_context(|| format!("Invalid total time {:?}", args.total_time))?,
        agents: (1..=args.agents)
            .map(|id| Agent {
                id,
                mac: format!("02:00:00:00:00:{id:02X}"),
            })
            .collect(),
        noisy: args.noisy,
        ..DeviceState::default()
    };

    let device = MockDevice::spawn_with_state(&args.bind, state)
        .with_context(|| format!("Failed to listen on {}", args.bind))?;
    info!("Serving on {}, Ctrl+C to quit", device.addr());
    device.join();
    Ok(())
}
