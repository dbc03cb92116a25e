//! Network module - the lockstep synchronization core
//!
//! Provides:
//! - A portable socket layer with normalized errors
//! - The server interface: slots, command merging, desync detection
//! - The client interface: command submission and per-tick delivery

mod client;
mod connection;
mod server;
mod slot;
pub mod socket;
mod sync;

pub use client::{ClientEvent, ClientInterface};
pub use server::{ServerError, ServerEvent, ServerInterface};
pub use slot::MAX_SLOTS;
pub use socket::poll_readiness;

use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration for the network interfaces
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port the session listens on or connects to
    pub game_port: u16,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Slot capacity (clamped to [`MAX_SLOTS`])
    pub max_slots: usize,
    /// Listen backlog
    pub backlog: u32,
    /// Connection attempt timeout
    pub connect_timeout: Duration,
    /// How long a freshly accepted connection may take to complete the intro
    pub intro_timeout: Duration,
    /// Keep-alive ping cadence
    pub heartbeat_interval: Duration,
    /// A connection silent for this long is considered dead
    pub keepalive_timeout: Duration,
    /// Sim ticks to withhold a tick's merge waiting on laggards
    pub grace_window_ticks: u32,
    /// Consecutive missed ticks after which a laggard slot is disconnected
    pub disconnect_threshold_ticks: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            game_port: crate::protocol::GAME_PORT,
            bind_address: None,
            max_slots: MAX_SLOTS,
            backlog: 16,
            connect_timeout: Duration::from_millis(5000),
            intro_timeout: Duration::from_millis(10000),
            heartbeat_interval: Duration::from_millis(1000),
            keepalive_timeout: Duration::from_millis(15000),
            grace_window_ticks: 1,
            disconnect_threshold_ticks: 30,
        }
    }
}

impl NetworkConfig {
    pub fn new(game_port: u16) -> Self {
        Self {
            game_port,
            ..Default::default()
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        let host = self.bind_address.as_deref().unwrap_or("0.0.0.0");
        format!("{}:{}", host, self.game_port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.game_port)))
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve host: {}", host),
        )
    })
}
