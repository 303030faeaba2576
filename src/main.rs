// Copyright (c) 2026 moldwatch maintainers
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/moldwatch/moldwatch-rs

//! moldwatch - Injection-Molding Floor Monitor
//!
//! Consumes PLC digital-output bytes pushed by the floor polling daemon and
//! serves machine states, the hourly production ledger, and OEE/MTBF/MTTR
//! metrics over a WebSocket API, with optional MQTT event fan-out.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use moldwatch::signals::PlcSimulator;
use moldwatch::{Config, Database, Engine, StreamingManager, VERSION};

/// moldwatch - Injection-Molding Floor Monitor
#[derive(Parser, Debug)]
#[command(name = "moldwatch")]
#[command(author = "moldwatch maintainers")]
#[command(version = VERSION)]
#[command(about = "Machine states, production ledger, and OEE metrics from PLC signal bytes")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// Demo mode with a simulated PLC feed
    #[arg(long)]
    demo: bool,

    /// WebSocket server port
    #[arg(long)]
    ws_port: Option<u16>,

    /// MQTT broker address
    #[arg(long)]
    mqtt_broker: Option<String>,

    /// Data output directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.trace {
        Level::TRACE
    } else if args.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("moldwatch v{} - Injection-Molding Floor Monitor", VERSION);

    // Load or create configuration
    let config_path = args.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;

    // Override with command line args
    if args.demo {
        config.demo_mode = true;
    }
    if let Some(data_dir) = args.data_dir {
        config.database.path = data_dir.join("moldwatch.db");
        config.data_dir = data_dir;
    }
    if let Some(port) = args.ws_port {
        config.streaming.websocket_port = port;
    }
    if let Some(mqtt) = args.mqtt_broker {
        config.streaming.mqtt_enabled = true;
        config.streaming.mqtt_broker = mqtt;
    }

    info!("Configuration loaded from {:?}", config_path);
    info!("Demo mode: {}", config.demo_mode);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    use tokio::sync::broadcast;

    let db = Arc::new(Database::open(&config.database)?);

    if config.demo_mode {
        PlcSimulator::seed_inventory(&db)?;
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let engine = Engine::new(config.clone(), db.clone())?;
    engine.start(&shutdown_tx).await?;

    let streaming = StreamingManager::new(config.streaming.clone(), engine.clone()).await?;
    streaming.start(engine.bus(), shutdown_tx.clone()).await?;

    if config.demo_mode {
        let ingest = engine.signal_ingest();
        let ingest_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let simulator = PlcSimulator::new(ingest, Duration::from_secs(2));
            simulator.run(ingest_rx).await;
        });
    }

    info!("moldwatch running; press Ctrl+C to shut down");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received, cleaning up...");
    let _ = shutdown_tx.send(());

    info!("moldwatch shutdown complete");
    Ok(())
}
