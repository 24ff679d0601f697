//! Courier gateway - HTTP and binary-stream entry point.
//!
//! Accepts client requests, wraps each one in a protocol envelope, and
//! relays it to the named backend service; a separate listener takes raw
//! binary stream feeds.

mod handler;
mod routes;
mod server;
mod stream;

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::{CooldownController, RpcRelay};
use routes::RouteTable;
use server::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use stream::{RelayStreamListener, StreamRegistry, StreamServer};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "courier-gateway")]
#[command(about = "Gateway node for the Courier messaging backend")]
struct Args {
    /// Port for the HTTP boundary (0 = auto-assign)
    #[arg(short, long, default_value = "7070")]
    port: u16,

    /// Port for the binary stream listener (0 = auto-assign)
    #[arg(long, default_value = "7171")]
    stream_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Backend services to attach, as name=host:port (repeatable)
    #[arg(short, long = "service")]
    services: Vec<String>,

    /// Stream frame types forwarded to the backend (repeatable)
    #[arg(long = "stream-kind", default_values_t = [String::from("audio"), String::from("video")])]
    stream_kinds: Vec<String>,

    /// Backend service stream chunk notices are relayed to
    #[arg(long, default_value = "kernel")]
    stream_service: String,

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

    info!("starting Courier gateway");

    let relay = Arc::new(RpcRelay::new());
    for spec in &args.services {
        let (name, addr) = parse_service(spec)?;
        match relay.connect(name, addr).await {
            Ok(()) => info!("attached service '{}' at {}", name, addr),
            // The gateway still serves the others; requests to this
            // service answer 408 until it is reattached.
            Err(e) => warn!("could not attach service '{}': {}", name, e),
        }
    }

    let state = Arc::new(AppState {
        relay: relay.clone(),
        cooldown: Arc::new(CooldownController::new()),
        routes: RouteTable::standard(),
    });

    let http_addr = server::start_server(state, &args.host, args.port).await?;
    info!("HTTP boundary on {}", http_addr);

    let mut stream_registry = StreamRegistry::new();
    let forwarder = Arc::new(RelayStreamListener::new(relay, args.stream_service.clone()));
    for kind in &args.stream_kinds {
        stream_registry.register(kind.clone(), forwarder.clone());
    }

    let stream_addr = format!("{}:{}", args.host, args.stream_port);
    let stream_handle = StreamServer::start(&stream_addr, stream_registry).await?;
    info!("stream listener on {}", stream_handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("gateway shutting down");
    Ok(())
}

fn parse_service(spec: &str) -> Result<(&str, SocketAddr)> {
    let (name, addr) = spec
        .split_once('=')
        .with_context(|| format!("bad service spec '{}', expected name=host:port", spec))?;
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("bad service address in '{}'", spec))?;
    Ok((name, addr))
}
