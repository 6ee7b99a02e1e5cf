//! Room Signal Server - Main Entry Point
//!
//! HTTP join handshake and WebSocket signaling channel for password-gated
//! WebRTC rooms.

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;

use room_signal::gateway::{self, AppState};
use room_signal::{RoomPolicy, ServerConfig};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "room-signal-server")]
#[command(about = "Room Signal Server - WebRTC signaling for password-gated rooms")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/server.toml")]
    config: PathBuf,

    /// Override host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Override listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// Only allow rooms listed in the configuration
    #[arg(long)]
    restricted: bool,

    /// Log level, overrides the configuration file
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = args.config.exists();
    let mut config = if config_found {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    if !config_found {
        info!("Config file {} not found, using defaults", args.config.display());
    }
    config.apply_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.restricted {
        config.room_policy = RoomPolicy::Restricted;
    }
    config.validate()?;

    match config.room_policy {
        RoomPolicy::Restricted if config.rooms.is_empty() => {
            warn!("Restricted mode with no provisioned rooms: every join will be refused");
        }
        RoomPolicy::Open if config.default_password.is_none() => {
            info!("No shared room password; rooms must be created through POST /rooms");
        }
        _ => {}
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let state = AppState::from_config(config);
    let maintenance = gateway::spawn_maintenance(state.clone());

    let listener = TcpListener::bind(addr).await?;
    info!("Room Signal Server listening on {}", addr);

    gateway::serve(listener, state, shutdown_signal()).await?;

    maintenance.abort();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
