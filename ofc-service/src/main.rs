//! ofc controller daemon
//!
//! Waits for one switch, tracks its flows in a hardware L2 table and a
//! software table, and dumps the controller state as JSON when it stops.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ofc_core::ControllerConfig;
use ofc_flow::{AnyFlow, FlowService, FlowTable, L2Destination};
use ofc_hal::{ConnectionStatus, Controller};

#[derive(Parser, Debug)]
#[command(name = "ofc-service")]
#[command(about = "OpenFlow 1.0 controller for a single switch")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TCP port the switch connects to (overrides OFC_LISTEN_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Switch address allowed to connect; repeat for several
    #[arg(long = "allow")]
    allow: Vec<IpAddr>,

    /// Packet-in worker tasks
    #[arg(long)]
    workers: Option<usize>,

    /// Flow statistics polling period in milliseconds
    #[arg(long)]
    stats_interval_ms: Option<u64>,

    /// Capacity of the hardware L2 table
    #[arg(long, default_value = "1024")]
    hw_table_size: usize,

    /// Capacity of the software table
    #[arg(long, default_value = "8192")]
    sw_table_size: usize,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the effective configuration and exit
    ShowConfig,
}

impl Args {
    fn apply(&self, mut config: ControllerConfig) -> ControllerConfig {
        if let Some(port) = self.port {
            config.listen_port = port;
        }
        if !self.allow.is_empty() {
            config.allowed_remotes = self.allow.clone();
        }
        if let Some(workers) = self.workers {
            config.packet_in_workers = workers;
        }
        if let Some(ms) = self.stats_interval_ms {
            config.stats_poll_interval = Duration::from_millis(ms);
        }
        config
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("ofc_service=info".parse()?)
        .add_directive("ofc_hal=info".parse()?)
        .add_directive("ofc_flow=info".parse()?);
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from /etc/ofc/environment (if exists)
    let env_file = ofc_core::config::load_environment();

    let args = Args::parse();
    init_tracing(args.json_logs)?;
    if let Some(path) = env_file {
        info!("Loaded environment from {}", path);
    }

    let config = args.apply(ControllerConfig::from_env());
    config.validate()?;

    if let Some(Commands::ShowConfig) = args.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let grace = config.deleted_grace_period;
    let flows = Arc::new(FlowService::new(vec![
        FlowTable::new("hardware", args.hw_table_size, L2Destination).with_grace_period(grace),
        FlowTable::new("software", args.sw_table_size, AnyFlow).with_grace_period(grace),
    ]));

    let port = config.listen_port;
    let mut controller = Controller::new(config)?;
    controller.register_service(flows.clone())?;
    let mut status = controller.handle().status();

    info!(port, "Waiting for switch");
    let started = tokio::select! {
        res = controller.start() => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    match started {
        Some(res) => res?,
        None => {
            info!("Interrupted before a switch connected");
            controller.shutdown().await;
            return Ok(());
        }
    }
    info!(peer = ?controller.handle().engine().peer(), "Switch connected");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = status.wait_for(|s| *s == ConnectionStatus::Disconnected) => {
            error!("Switch session lost");
        }
    }

    controller.shutdown().await;

    let state = serde_json::json!({
        "switch": controller.switch_state().map(|s| s.snapshot()),
        "packet_in": controller.handle().pipeline().stats(),
        "flows": flows.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
