use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::{
    client::ReconnectPolicy,
    gateway::DEFAULT_BROADCAST_BUFFER,
    relay::DEFAULT_CAPACITY,
    server::{DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT, ServerConfig},
};

const DEFAULT_HOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server: WebSocket gateway, polling API and web UI.
    Serve(ServeArgs),
    /// Connect to a relay from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Without it, HOST and PORT from the
    /// environment are used, falling back to 0.0.0.0:3001.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Number of recent messages kept for late joiners.
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,

    /// Events a connection may fall behind before it is warned.
    #[arg(long, default_value_t = DEFAULT_BROADCAST_BUFFER)]
    pub broadcast_buffer: usize,

    /// Largest accepted WebSocket message or POST body, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServerConfig> {
        let listen = resolve_listen(
            self.listen,
            std::env::var("HOST").ok(),
            std::env::var("PORT").ok(),
        )?;
        Ok(ServerConfig {
            listen,
            capacity: self.capacity,
            broadcast_buffer: self.broadcast_buffer,
            max_frame_bytes: self.max_frame_bytes,
        })
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Name shown next to your messages.
    #[arg(long)]
    pub name: String,

    /// WebSocket URL of the relay.
    #[arg(long, default_value = "ws://127.0.0.1:3001/ws")]
    pub server: String,

    /// File that keeps a trailing window of history between runs.
    #[arg(long)]
    pub history: Option<PathBuf>,

    /// Connection attempts before giving up.
    #[arg(long, default_value_t = 5)]
    pub reconnect_attempts: u32,

    /// Fixed delay between connection attempts, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_delay_ms: u64,
}

impl ClientArgs {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            delay: Duration::from_millis(self.reconnect_delay_ms),
            max_attempts: self.reconnect_attempts.max(1),
        }
    }
}

fn resolve_listen(
    explicit: Option<SocketAddr>,
    host: Option<String>,
    port: Option<String>,
) -> Result<SocketAddr> {
    if let Some(addr) = explicit {
        return Ok(addr);
    }

    let ip = match host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        Some("localhost") => IpAddr::from([127, 0, 0, 1]),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("HOST must be an IP address, got '{raw}'"))?,
        None => DEFAULT_HOST,
    };
    let port = match port.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("PORT must be a port number, got '{raw}'"))?,
        None => DEFAULT_PORT,
    };

    Ok(SocketAddr::new(ip, port))
}
