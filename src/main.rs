//! Multi-Channel TCP Chat Server - Entry Point
//!
//! Loads configuration, starts the ChatServer and runs until Ctrl-C.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use channel_chat::{ChatServer, EventListener, ServerConfig, ServerEvent};

#[derive(Parser, Debug)]
#[command(name = "channel_chat")]
#[command(about = "Line-based multi-channel TCP chat server", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the server to
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Port to listen on (default 5000)
    #[arg(short, long)]
    port: Option<u16>,

    /// Close connections idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Channel to create at startup (repeatable)
    #[arg(long = "channel")]
    channels: Vec<String>,

    /// Print every server event as a JSON line on stdout
    #[arg(long)]
    json_events: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=channel_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("channel_chat=info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_json_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = Some(secs);
    }

    let port = config.port;
    let server = if args.json_events {
        let printer: Arc<dyn EventListener> =
            Arc::new(|event: &ServerEvent| match serde_json::to_string(event) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize event: {}", e),
            });
        ChatServer::with_listener(config, printer)
    } else {
        ChatServer::new(config)
    };

    let addr = server.start(port).await?;
    info!("Chat server listening on {}", addr);

    for name in &args.channels {
        server.create_channel(name)?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping");
    server.stop().await?;

    Ok(())
}
