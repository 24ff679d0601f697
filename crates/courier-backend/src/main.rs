//! Courier backend - one independently scaled backend service unit.
//!
//! Hosts a fabric server whose inbound envelopes run through the task
//! pipeline against the registered action handlers.

mod service;

use anyhow::Result;
use clap::Parser;
use courier_core::FabricServer;
use service::BackendService;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-backend")]
#[command(about = "Backend service unit for the Courier messaging backend")]
struct Args {
    /// Service name gateways attach to
    #[arg(short, long, default_value = "kernel")]
    name: String,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the fabric server (0 = auto-assign)
    #[arg(short, long, default_value = "7200")]
    port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("starting Courier backend '{}'", args.name);

    let unit = BackendService::new(args.name.clone());
    let addr = format!("{}:{}", args.host, args.port);
    let mut handle = FabricServer::start(&addr, Arc::new(unit.pipeline.clone())).await?;
    info!("service '{}' serving on {}", args.name, handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("backend '{}' shutting down", args.name);
    handle.shutdown();
    Ok(())
}
