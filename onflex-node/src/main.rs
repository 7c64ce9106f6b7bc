//! OnFlex Node - charge point controller
//!
//! Runs the station against simulated hardware driven from the console.
//!
//! # Usage
//!
//! ```bash
//! # Connect to the central system from the config file
//! onflex-node --config config/onflex.json --id-tags config/id_tags.json
//!
//! # Override the endpoint, send BootNotification only once
//! onflex-node --config config/onflex.json \
//!     --endpoint ws://localhost:8180/steve/websocket/CentralSystemService/ONFLEX-001 \
//!     --boot-once
//!
//! # No backend at all: an in-process central system accepts everything
//! onflex-node --simulate-backend
//! ```
//!
//! # Console
//!
//! `plug`, `ready`, `unplug` set the control pilot to B, C, A;
//! `tag <id>` presents an id tag; `energy <wh>` sets the meter reading.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use onflex_evse::sim::{Behaviour, SimCommand};
use onflex_evse::{
    BootPolicy, CentralSystemSim, IdTagLists, SevenZipCommand, SimHardware, Station, StationConfig,
    Transport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// OnFlex OCPP 1.6 charge point controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station config (JSON); built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Privileged id tag table (JSON)
    #[arg(long, default_value = "config/id_tags.json")]
    id_tags: PathBuf,

    /// Central system WebSocket URL, overrides the config file
    #[arg(long)]
    endpoint: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Send BootNotification only on the first connection
    #[arg(long)]
    boot_once: bool,

    /// Answer OCPP calls in-process instead of connecting
    #[arg(long)]
    simulate_backend: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => StationConfig::load(path)?,
        None => StationConfig::default(),
    };
    if let Some(endpoint) = &args.endpoint {
        config = config.with_endpoint(endpoint);
        config.validate()?;
    }
    if args.boot_once {
        config = config.with_boot_policy(BootPolicy::OncePerProcess);
    }
    let id_tags = IdTagLists::load_or_default(&args.id_tags);

    let endpoint = if args.simulate_backend {
        "(simulated)".to_string()
    } else {
        config.ocpp.endpoint.clone()
    };
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              OnFlex Node - OCPP 1.6 Charge Point             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Vendor:   {:<50} ║", truncate(&config.ocpp.vendor_id, 50));
    println!("║  Model:    {:<50} ║", truncate(&config.ocpp.model_id, 50));
    println!("║  Endpoint: {:<50} ║", truncate(&endpoint, 50));
    println!("║  Boot:     {:<50} ║", format!("{:?}", config.boot_policy));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let sim = SimHardware::new();
    let transport = if args.simulate_backend {
        Transport::Loopback
    } else {
        Transport::WebSocket
    };
    let station = Station::new(config, id_tags, sim.hardware(), Arc::new(SevenZipCommand::default()))
        .with_transport(transport);

    let _central = match transport {
        Transport::Loopback => Some(CentralSystemSim::attach(station.client(), Behaviour::default()).await),
        Transport::WebSocket => None,
    };

    tokio::spawn(console(sim));

    tokio::select! {
        _ = station.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
    }

    Ok(())
}

/// Apply console commands to the simulated hardware
async fn console(sim: SimHardware) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match SimCommand::parse(&line) {
                Some(command) => {
                    info!("Console: {:?}", command);
                    sim.apply(&command);
                }
                None => eprintln!("Commands: plug | ready | unplug | tag <id> | energy <wh>"),
            },
            Ok(None) => return,
            Err(e) => {
                warn!("Console read failed: {}", e);
                return;
            }
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 3).collect();
        format!("{}...", cut)
    }
}
