//! StratNet - Lockstep Strategy Game Networking
//!
//! A deterministic lockstep synchronization core: a slot-based session
//! server, a joining client, and UDP LAN discovery.

mod config;
mod discovery;
mod network;
mod protocol;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use discovery::{DiscoveryEvent, DiscoveryResponder, SessionInfo, SessionWatcher};
use network::{ClientEvent, ClientInterface, ServerError, ServerEvent, ServerInterface};
use protocol::PlayerInfo;

/// StratNet - lockstep strategy game networking
#[derive(Parser)]
#[command(name = "stratnet")]
#[command(author = "StratNet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Host and join deterministic lockstep sessions", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session
    Host {
        /// Port to listen on
        #[arg(short, long, default_value_t = protocol::GAME_PORT)]
        port: u16,

        /// Session name to advertise
        #[arg(short, long)]
        session: Option<String>,

        /// Launch once this many players are seated
        #[arg(long, default_value_t = 1)]
        start_after: usize,

        /// Simulation tick interval in milliseconds
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,

        /// Do not announce on the LAN
        #[arg(long)]
        no_announce: bool,
    },

    /// Join a session
    Join {
        /// Server address to connect to
        #[arg(short, long)]
        server: Option<String>,

        /// Server port
        #[arg(short, long, default_value_t = protocol::GAME_PORT)]
        port: u16,

        /// Find a session on the LAN instead of specifying one
        #[arg(short, long)]
        discover: bool,
    },

    /// Show current configuration
    Config {
        /// Write the current configuration to a file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Discover sessions on the LAN
    Discover {
        /// How long to scan (seconds)
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    match cli.command {
        Commands::Host {
            port,
            session,
            start_after,
            tick_ms,
            no_announce,
        } => {
            run_host(config, port, session, start_after, tick_ms, !no_announce).await?;
        }
        Commands::Join {
            server,
            port,
            discover,
        } => {
            run_join(config, server, port, discover).await?;
        }
        Commands::Config { output } => {
            if let Some(path) = output {
                config.save(&path)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Discover { timeout } => {
            run_discovery(timeout).await?;
        }
        Commands::Info => {
            print_protocol_info();
        }
    }

    Ok(())
}

/// The demo simulation's checksum: both ends hash the merged command set
/// they applied for a tick, so agreement means identical state transitions.
fn tick_checksum(tick: u32, commands: &[Vec<u8>]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    let mut mix = |byte: u8| {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(0x01000193);
    };
    for byte in tick.to_be_bytes() {
        mix(byte);
    }
    for command in commands {
        for &byte in command {
            mix(byte);
        }
        mix(0xff);
    }
    hash
}

/// Host a session: accept players, launch, then drive the tick loop
async fn run_host(
    config: Config,
    port: u16,
    session: Option<String>,
    start_after: usize,
    tick_ms: u64,
    announce: bool,
) -> anyhow::Result<()> {
    let session_name = session.unwrap_or_else(|| format!("{}'s game", config.player.name));
    let host_player = PlayerInfo::new(&config.player.name, &config.player.faction, config.player.team);

    let mut net_config = config.runtime_network();
    net_config.game_port = port;

    tracing::info!("Hosting session '{}' on port {}", session_name, port);

    let mut server = ServerInterface::new(net_config.clone(), session_name.clone(), host_player);
    let mut event_rx = server.take_event_receiver().unwrap();
    let bind_addr = server.start().await?;

    // A configured player_id keeps the session identity stable across
    // restarts; otherwise a fresh one is minted per run.
    let session_id = config.player_id();
    let mut responder = None;
    if announce && config.discovery.enabled {
        let mut r = DiscoveryResponder::new(SessionInfo {
            session_id: session_id.clone(),
            session: session_name.clone(),
            host: config.player.name.clone(),
            game_port: bind_addr.port(),
            occupied_slots: 0,
            max_slots: net_config.max_slots,
            launched: false,
        })
        .with_port(config.discovery.port);
        r.start().await?;
        responder = Some(r);
    }

    println!("\n========================================");
    println!("  StratNet Session Hosted");
    println!("========================================");
    println!("  Session: {}", session_name);
    println!("  Address: {}", bind_addr);
    println!("  Slots:   {}", net_config.max_slots);
    println!("========================================");
    println!("\nWaiting for players (launching after {})...", start_after);
    println!("Press Ctrl+C to stop.\n");

    let mut tick_timer = tokio::time::interval(Duration::from_millis(tick_ms));
    let mut launched = false;

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::SlotConnected { slot, player, addr } => {
                        println!("+ {} joined slot {} ({})", player.name, slot, addr);
                        let occupied = server.occupied_slots().await;
                        if let Some(r) = &responder {
                            r.update_info(SessionInfo {
                                session_id: session_id.clone(),
                                session: session_name.clone(),
                                host: config.player.name.clone(),
                                game_port: bind_addr.port(),
                                occupied_slots: occupied,
                                max_slots: net_config.max_slots,
                                launched,
                            }).await;
                        }
                        if !launched && occupied >= start_after {
                            println!("Launching with {} players...", occupied);
                            server.launch_game().await?;
                            launched = true;
                        }
                    }
                    ServerEvent::SlotDisconnected { slot, reason } => {
                        println!("- slot {} left ({})", slot, reason);
                    }
                    ServerEvent::ConnectionRejected { addr, reason } => {
                        println!("! refused {} ({})", addr, reason);
                    }
                    ServerEvent::ChatReceived { text, sender, .. } => {
                        println!("[{}] {}", sender, text);
                    }
                    ServerEvent::OutOfSync { tick } => {
                        eprintln!("FATAL: state divergence at tick {}", tick);
                        break;
                    }
                    _ => {}
                }
            }
            _ = tick_timer.tick(), if launched => {
                match server.close_tick().await {
                    Ok(Some(outcome)) => {
                        let checksum = tick_checksum(outcome.tick, &outcome.commands);
                        if let Err(e) = server.submit_local_checksum(outcome.tick, checksum).await {
                            eprintln!("FATAL: {}", e);
                            break;
                        }
                        for slot in outcome.dropped_slots {
                            println!("- slot {} dropped (lagged out)", slot);
                        }
                    }
                    Ok(None) => {} // merge withheld for laggards
                    Err(ServerError::OutOfSync { tick }) => {
                        eprintln!("FATAL: state divergence at tick {}", tick);
                        break;
                    }
                    Err(e) => {
                        eprintln!("FATAL: {}", e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    if let Some(mut r) = responder {
        r.stop();
    }
    server.stop().await?;
    tracing::info!("Session stopped");

    Ok(())
}

/// Join a session and follow the lockstep from tick 0
async fn run_join(
    config: Config,
    server_addr: Option<String>,
    port: u16,
    discover: bool,
) -> anyhow::Result<()> {
    let player = PlayerInfo::new(&config.player.name, &config.player.faction, config.player.team);

    let server_socket_addr: SocketAddr = if let Some(addr) = server_addr {
        if addr.contains(':') {
            addr.parse()?
        } else {
            network::resolve_host(&addr, port).await?
        }
    } else if discover {
        println!("Discovering sessions...");
        let sessions = discovery::discover(Duration::from_secs(3)).await?;
        let Some(found) = sessions.iter().find(|s| !s.info.launched) else {
            anyhow::bail!("No joinable session found on the LAN.");
        };
        println!("Found '{}' hosted by {}", found.info.session, found.info.host);
        found.addr
    } else {
        anyhow::bail!("Please specify --server address or use --discover");
    };

    let mut client = ClientInterface::new(config.runtime_network(), player);
    let mut event_rx = client.take_event_receiver().unwrap();

    println!("Connecting to {}...", server_socket_addr);
    let hello = client.connect(server_socket_addr).await?;

    println!("\n========================================");
    println!("  StratNet Session Joined");
    println!("========================================");
    println!("  Session: {}", hello.session);
    println!("  Slot:    {}", hello.slot_index);
    println!("========================================");
    println!("\nWaiting for launch. Press Ctrl+C to leave.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ClientEvent::LaunchReceived => {
                        println!("Match launched, entering lockstep.");
                        // Feed tick 0 so the first merge is not waiting on us
                        client.send_commands(0, Vec::new()).await?;
                    }
                    ClientEvent::TickCommands { tick } => {
                        if let Some(commands) = client.take_tick_commands(tick).await {
                            let checksum = tick_checksum(tick, &commands);
                            client.send_sync_check(tick, checksum).await?;
                            client.send_commands(tick + 1, Vec::new()).await?;
                            if tick % 100 == 0 {
                                tracing::debug!("tick {} applied ({} commands)", tick, commands.len());
                            }
                        }
                    }
                    ClientEvent::ChatReceived { text, sender, .. } => {
                        println!("[{}] {}", sender, text);
                    }
                    ClientEvent::Disconnected { reason } => {
                        println!("Disconnected: {}", reason);
                        break;
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nLeaving...");
                break;
            }
        }
    }

    if client.is_connected() {
        client.disconnect("leaving").await?;
    }
    tracing::info!("Left session");

    Ok(())
}

/// Scan the LAN for sessions, reporting changes as they arrive
async fn run_discovery(timeout_secs: u64) -> anyhow::Result<()> {
    println!("Scanning for sessions ({} seconds)...\n", timeout_secs);

    let mut watcher = SessionWatcher::new();
    let mut event_rx = watcher.take_event_receiver().unwrap();
    watcher.start().await?;

    let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                DiscoveryEvent::SessionDiscovered(found) => {
                    println!("+ {}  @ {}", session_line(&found), found.addr);
                }
                DiscoveryEvent::SessionUpdated(found) => {
                    println!("~ {}  @ {}", session_line(&found), found.addr);
                }
                DiscoveryEvent::SessionLost(id) => {
                    println!("- session {} no longer announcing", id);
                }
            },
            _ = &mut deadline => break,
        }
    }

    let sessions = watcher.sessions().await;
    watcher.stop();

    if sessions.is_empty() {
        println!("No sessions found.");
    } else {
        println!("\n{} session(s) found.", sessions.len());
    }

    Ok(())
}

fn session_line(found: &discovery::DiscoveredSession) -> String {
    let state = if found.info.launched { "in progress" } else { "open" };
    format!(
        "{}  {}/{} players  ({})",
        found.info.session, found.info.occupied_slots, found.info.max_slots, state
    )
}

/// Print protocol information
fn print_protocol_info() {
    println!("StratNet Protocol Information");
    println!("=============================\n");
    println!("Protocol Version: {}", protocol::PROTOCOL_VERSION);
    println!("Game Port:        {}", protocol::GAME_PORT);
    println!("Discovery Port:   {}", protocol::DISCOVERY_PORT);
    println!("Max Slots:        {}", network::MAX_SLOTS);
    println!("Frame Header:     {} bytes", protocol::HEADER_SIZE);
    println!("Max Payload:      {} bytes", protocol::MAX_PAYLOAD_SIZE);
}
