//! Client interface
//!
//! The joining end of a lockstep session. Connects, runs the intro
//! exchange, submits local commands and checksums, and buffers the merged
//! command broadcasts until the local simulation is ready to consume them.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, Notify};

use super::connection::{unix_micros, Connection, ConnectionError, ConnectionHandle, ServerHello};
use super::socket::{Socket, SocketError};
use super::NetworkConfig;
use crate::protocol::{Message, PlayerInfo, TickChecksum};

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("timed out")]
    Timeout,
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Events emitted by the client
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Intro exchange complete
    Connected {
        session: String,
        slot_index: i8,
        host: String,
    },
    /// The server closed the lobby; lockstep begins at tick 0
    LaunchReceived,
    /// A merged command set arrived and is buffered for pickup
    TickCommands { tick: u32 },
    /// Chat relayed by the server
    ChatReceived {
        text: String,
        sender: String,
        team: i8,
    },
    /// The link is gone, cleanly or otherwise
    Disconnected { reason: String },
}

#[derive(Default)]
struct ClientState {
    /// tick -> merged command set, buffered until consumed
    ticks: BTreeMap<u32, Vec<Vec<u8>>>,
    launched: bool,
}

/// The joining session endpoint
pub struct ClientInterface {
    config: NetworkConfig,
    player: PlayerInfo,
    state: Arc<Mutex<ClientState>>,
    tick_notify: Arc<Notify>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    handle: Option<ConnectionHandle>,
    server: Option<ServerHello>,
}

impl ClientInterface {
    pub fn new(config: NetworkConfig, player: PlayerInfo) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            player,
            state: Arc::new(Mutex::new(ClientState::default())),
            tick_notify: Arc::new(Notify::new()),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx,
            connected: Arc::new(AtomicBool::new(false)),
            handle: None,
            server: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn player(&self) -> &PlayerInfo {
        &self.player
    }

    /// Session name learned from the intro, if connected
    pub fn session(&self) -> Option<&str> {
        self.server.as_ref().map(|s| s.session.as_str())
    }

    /// Slot assigned by the server, if connected
    pub fn slot_index(&self) -> Option<i8> {
        self.server.as_ref().map(|s| s.slot_index)
    }

    pub async fn launched(&self) -> bool {
        self.state.lock().await.launched
    }

    /// Connect, run the intro exchange, and spawn the reader task
    pub async fn connect(&mut self, addr: SocketAddr) -> ClientResult<ServerHello> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(ClientError::AlreadyConnected);
        }

        let socket = Socket::connect(addr, self.config.connect_timeout).await?;
        let mut conn = Connection::new(socket);
        let hello = conn
            .handshake_client(&self.player, self.config.intro_timeout)
            .await?;

        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(256);
        let handle = ConnectionHandle::new(frame_tx);
        self.handle = Some(handle.clone());
        self.server = Some(hello.clone());
        self.connected.store(true, Ordering::SeqCst);

        let _ = self
            .event_tx
            .send(ClientEvent::Connected {
                session: hello.session.clone(),
                slot_index: hello.slot_index,
                host: conn
                    .remote_player()
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
            })
            .await;

        let state = self.state.clone();
        let tick_notify = self.tick_notify.clone();
        let event_tx = self.event_tx.clone();
        let connected = self.connected.clone();
        let shutdown = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let reason = run_reader_loop(
                &mut conn,
                frame_rx,
                &handle,
                state,
                tick_notify,
                &event_tx,
                shutdown,
            )
            .await;
            handle.mark_disconnected();
            connected.store(false, Ordering::SeqCst);
            let _ = event_tx.send(ClientEvent::Disconnected { reason }).await;
            conn.close("leaving").await;
        });

        Ok(hello)
    }

    fn handle(&self) -> ClientResult<&ConnectionHandle> {
        match &self.handle {
            Some(handle) if handle.is_connected() => Ok(handle),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Submit this participant's command set for a tick
    pub async fn send_commands(&self, tick: u32, commands: Vec<Vec<u8>>) -> ClientResult<()> {
        self.handle()?
            .send(&Message::Command { tick, commands })
            .await?;
        Ok(())
    }

    /// Report the local simulation checksum for a tick
    pub async fn send_sync_check(&self, tick: u32, checksum: u32) -> ClientResult<()> {
        self.handle()?
            .send(&Message::SyncCheck(TickChecksum { tick, checksum }))
            .await?;
        Ok(())
    }

    /// Send a chat line; the server relays it to the other participants
    pub async fn send_chat(&self, text: &str) -> ClientResult<()> {
        self.handle()?
            .send(&Message::Text {
                text: text.to_string(),
                sender: self.player.name.clone(),
                team: self.player.team,
            })
            .await?;
        Ok(())
    }

    /// Take the merged command set for a tick if it already arrived
    pub async fn take_tick_commands(&self, tick: u32) -> Option<Vec<Vec<u8>>> {
        self.state.lock().await.ticks.remove(&tick)
    }

    /// Wait until the merged command set for `tick` arrives, up to `timeout`.
    /// The simulation must not advance past a tick it has not received.
    pub async fn wait_tick_commands(
        &self,
        tick: u32,
        timeout: Duration,
    ) -> ClientResult<Vec<Vec<u8>>> {
        let wait = async {
            loop {
                let notified = self.tick_notify.notified();
                if let Some(commands) = self.state.lock().await.ticks.remove(&tick) {
                    return commands;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::Timeout)
    }

    /// Leave the session with a quit notice
    pub async fn disconnect(&mut self, reason: &str) -> ClientResult<()> {
        let handle = self.handle.take().ok_or(ClientError::NotConnected)?;
        let _ = handle
            .send(&Message::QuitGame {
                reason: reason.to_string(),
            })
            .await;
        handle.mark_disconnected();
        let _ = self.shutdown_tx.send(true);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_reader_loop(
    conn: &mut Connection,
    mut frame_rx: mpsc::Receiver<Bytes>,
    handle: &ConnectionHandle,
    state: Arc<Mutex<ClientState>>,
    tick_notify: Arc<Notify>,
    event_tx: &mpsc::Sender<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> String {
    loop {
        tokio::select! {
            result = conn.recv() => match result {
                Ok(Some(message)) => {
                    if let Err(reason) =
                        dispatch_server_message(message, conn, handle, &state, &tick_notify, event_tx).await
                    {
                        break reason;
                    }
                }
                Ok(None) => break "connection closed by server".to_string(),
                Err(e) => break format!("receive error: {e}"),
            },
            Some(frame) = frame_rx.recv() => {
                if let Err(e) = conn.send_frame(&frame).await {
                    break format!("send error: {e}");
                }
            }
            _ = shutdown.changed() => {
                while let Ok(frame) = frame_rx.try_recv() {
                    let _ = conn.send_frame(&frame).await;
                }
                break "disconnected by local request".to_string();
            }
        }
    }
}

/// Dispatch one frame from the server. `Err` carries a disconnect reason.
async fn dispatch_server_message(
    message: Message,
    conn: &mut Connection,
    handle: &ConnectionHandle,
    state: &Arc<Mutex<ClientState>>,
    tick_notify: &Arc<Notify>,
    event_tx: &mpsc::Sender<ClientEvent>,
) -> Result<(), String> {
    match message {
        Message::Command { tick, commands } => {
            {
                let mut state = state.lock().await;
                state.ticks.insert(tick, commands);
            }
            tick_notify.notify_waiters();
            let _ = event_tx.send(ClientEvent::TickCommands { tick }).await;
            Ok(())
        }
        Message::LaunchGame => {
            state.lock().await.launched = true;
            tracing::info!("launch received, lockstep begins at tick 0");
            let _ = event_tx.send(ClientEvent::LaunchReceived).await;
            Ok(())
        }
        Message::Text { text, sender, team } => {
            let _ = event_tx
                .send(ClientEvent::ChatReceived { text, sender, team })
                .await;
            Ok(())
        }
        Message::QuitGame { reason } => Err(reason),
        Message::Ping { timestamp } => {
            conn.send(&Message::Pong { timestamp })
                .await
                .map_err(|e| format!("pong failed: {e}"))?;
            Ok(())
        }
        Message::Pong { timestamp } => {
            handle.update_rtt(unix_micros().saturating_sub(timestamp));
            Ok(())
        }
        Message::Intro { .. } => Err("protocol violation: unexpected Intro".to_string()),
        Message::SyncCheck(_) => Err("protocol violation: server sent SyncCheck".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::{ServerEvent, ServerInterface};

    fn server_config() -> NetworkConfig {
        NetworkConfig {
            game_port: 0,
            bind_address: Some("127.0.0.1".to_string()),
            ..Default::default()
        }
    }

    async fn started_server() -> (ServerInterface, SocketAddr) {
        let mut server = ServerInterface::new(
            server_config(),
            "duel".to_string(),
            PlayerInfo::new("host", "magic", 0),
        );
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn test_connect_learns_session_and_slot() {
        let (server, addr) = started_server().await;

        let mut client =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        let hello = client.connect(addr).await.unwrap();

        assert_eq!(hello.session, "duel");
        assert_eq!(hello.slot_index, 0);
        assert!(client.is_connected());
        assert_eq!(client.session(), Some("duel"));
        assert_eq!(client.slot_index(), Some(0));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.occupied_slots().await, 1);
    }

    #[tokio::test]
    async fn test_double_connect_refused_locally() {
        let (_server, addr) = started_server().await;

        let mut client =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        client.connect(addr).await.unwrap();
        let err = client.connect(addr).await.unwrap_err();
        assert!(matches!(err, ClientError::AlreadyConnected));
    }

    #[tokio::test]
    async fn test_launch_event_reaches_client() {
        let (server, addr) = started_server().await;

        let mut client =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        client.connect(addr).await.unwrap();
        let mut events = client.take_event_receiver().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        server.launch_game().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(client.launched().await);
        let mut saw_launch = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::LaunchReceived) {
                saw_launch = true;
            }
        }
        assert!(saw_launch);
    }

    #[tokio::test]
    async fn test_chat_relayed_to_other_client() {
        let (_server, addr) = started_server().await;

        let mut alice =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        alice.connect(addr).await.unwrap();
        let mut bob =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("bob", "magic", 2));
        bob.connect(addr).await.unwrap();
        let mut bob_events = bob.take_event_receiver().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        alice.send_chat("gl hf").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mut relayed = false;
        while let Ok(event) = bob_events.try_recv() {
            if let ClientEvent::ChatReceived { text, sender, .. } = event {
                if text == "gl hf" {
                    assert_eq!(sender, "alice");
                    relayed = true;
                }
            }
        }
        assert!(relayed);
    }

    #[tokio::test]
    async fn test_wait_tick_commands_times_out_when_withheld() {
        let (server, addr) = started_server().await;

        let mut client =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        client.connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.launch_game().await.unwrap();

        // No tick was closed, so nothing arrives
        let err = client
            .wait_tick_commands(0, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
    }

    #[tokio::test]
    async fn test_disconnect_frees_the_slot() {
        let (mut server, addr) = started_server().await;
        let mut events = server.take_event_receiver().unwrap();

        let mut client =
            ClientInterface::new(NetworkConfig::default(), PlayerInfo::new("alice", "tech", 1));
        client.connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        client.disconnect("done playing").await.unwrap();
        assert!(!client.is_connected());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(server.occupied_slots().await, 0);
        let mut freed = false;
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::SlotDisconnected { slot, reason } = event {
                assert_eq!(slot, 0);
                assert!(reason.contains("done playing"), "got: {reason}");
                freed = true;
            }
        }
        assert!(freed);
    }
}
