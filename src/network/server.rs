//! Server interface
//!
//! The authoritative end of a lockstep session. Owns the slot table,
//! merges per-tick command submissions in ascending slot order, collects
//! checksums for desync detection, and broadcasts lifecycle messages.
//!
//! Tick advancement is caller-driven: the simulation loop calls
//! [`ServerInterface::close_tick`] once per step. There is no hidden event
//! loop inside the core; the spawned tasks only move frames and dispatch
//! them into the shared state.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

use super::connection::{unix_micros, Connection, ConnectionError, ConnectionHandle};
use super::slot::{SlotState, SlotTable};
use super::socket::{Listener, Socket};
use super::sync::{Participant, SyncOutcome, SyncTable};
use super::NetworkConfig;
use crate::protocol::{CodecError, Encoder, Message, PlayerInfo};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("socket error: {0}")]
    Socket(#[from] super::socket::SocketError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("server already running")]
    AlreadyRunning,

    #[error("server not running")]
    NotRunning,

    #[error("bind failed: {0}")]
    BindFailed(String),

    #[error("session out of sync at tick {tick}")]
    OutOfSync { tick: u32 },
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Events emitted by the server
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Listening socket is up
    Started { bind_addr: SocketAddr },
    /// A client completed the intro exchange and occupies a slot
    SlotConnected {
        slot: usize,
        player: PlayerInfo,
        addr: SocketAddr,
    },
    /// A slot entered lockstep after the launch broadcast
    SlotReady { slot: usize },
    /// A slot left the session; its seat is reusable
    SlotDisconnected { slot: usize, reason: String },
    /// An inbound connection was refused (capacity exhausted)
    ConnectionRejected { addr: SocketAddr, reason: String },
    /// Chat relayed from a slot
    ChatReceived {
        slot: usize,
        text: String,
        sender: String,
        team: i8,
    },
    /// Fatal checksum divergence; the session is over
    OutOfSync { tick: u32 },
    /// Server stopped
    Stopped,
}

/// Result of closing one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub tick: u32,
    /// The merged, globally-ordered command set that was broadcast
    pub commands: Vec<Vec<u8>>,
    /// Slots disconnected this tick for lagging past the threshold
    pub dropped_slots: Vec<usize>,
}

/// Simulation-relevant state. One mutex guards all of it; cross-task access
/// is never lock-free.
struct ServerState {
    slots: SlotTable,
    tick: u32,
    launched: bool,
    /// Ticks the current merge has been withheld waiting on laggards
    grace_elapsed: u32,
    /// tick -> slot -> submitted commands
    submissions: BTreeMap<u32, BTreeMap<usize, Vec<Vec<u8>>>>,
    /// The hosting simulation's own submissions, keyed by tick
    local_pending: BTreeMap<u32, Vec<Vec<u8>>>,
    sync: SyncTable,
    /// Set when a desync was detected; the session is unrecoverable
    fatal: Option<u32>,
}

impl ServerState {
    fn expected_participants(&self) -> Vec<Participant> {
        let mut expected = vec![Participant::Host];
        expected.extend(self.slots.ready_indices().into_iter().map(Participant::Slot));
        expected
    }
}

/// Shared context for the accept task and per-slot reader tasks
#[derive(Clone)]
struct ServerCtx {
    config: NetworkConfig,
    session_name: String,
    host_player: PlayerInfo,
    state: Arc<Mutex<ServerState>>,
    event_tx: mpsc::Sender<ServerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl ServerCtx {
    /// Serialize once, queue to every seated slot. A failure on one slot
    /// only disconnects that slot.
    async fn broadcast(&self, message: &Message) -> Result<(), CodecError> {
        let frame = Bytes::from(Encoder::new().encode_to_vec(message)?);
        self.broadcast_frame(frame).await;
        Ok(())
    }

    async fn broadcast_frame(&self, frame: Bytes) {
        let targets: Vec<(usize, ConnectionHandle)> = {
            let state = self.state.lock().await;
            state
                .slots
                .iter()
                .filter(|s| matches!(s.state, SlotState::Connected | SlotState::Ready))
                .filter_map(|s| s.handle.clone().map(|h| (s.index, h)))
                .collect()
        };

        for (index, handle) in targets {
            if let Err(e) = handle.send_frame(frame.clone()).await {
                tracing::warn!("broadcast to slot {index} failed: {e}");
                let mut state = self.state.lock().await;
                if let Some(slot) = state.slots.get_mut(index) {
                    slot.disconnect();
                }
            }
        }
    }

    /// Fatal path: record the diverging tick, notify the owner, and tell
    /// every remaining participant the session is over.
    async fn raise_out_of_sync(&self, tick: u32, reports: Vec<(Participant, u32)>) {
        {
            let mut state = self.state.lock().await;
            if state.fatal.is_some() {
                return;
            }
            state.fatal = Some(tick);
        }

        let detail = reports
            .iter()
            .map(|(who, sum)| format!("{who}={sum:#010x}"))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::error!("out of sync at tick {tick}: {detail}");

        let _ = self.event_tx.send(ServerEvent::OutOfSync { tick }).await;

        let _ = self
            .broadcast(&Message::Text {
                text: format!("state divergence detected at tick {tick}: {detail}"),
                sender: self.host_player.name.clone(),
                team: -1,
            })
            .await;
        let _ = self
            .broadcast(&Message::QuitGame {
                reason: format!("out of sync at tick {tick}"),
            })
            .await;
    }
}

/// The authoritative session endpoint
pub struct ServerInterface {
    ctx: ServerCtx,
    event_rx: Option<mpsc::Receiver<ServerEvent>>,
    shutdown_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl ServerInterface {
    pub fn new(config: NetworkConfig, session_name: String, host_player: PlayerInfo) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let state = ServerState {
            slots: SlotTable::new(config.max_slots),
            tick: 0,
            launched: false,
            grace_elapsed: 0,
            submissions: BTreeMap::new(),
            local_pending: BTreeMap::new(),
            sync: SyncTable::new(),
            fatal: None,
        };

        Self {
            ctx: ServerCtx {
                config,
                session_name,
                host_player,
                state: Arc::new(Mutex::new(state)),
                event_tx,
                shutdown: shutdown_rx,
            },
            event_rx: Some(event_rx),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn session_name(&self) -> &str {
        &self.ctx.session_name
    }

    /// Current authoritative tick
    pub async fn tick(&self) -> u32 {
        self.ctx.state.lock().await.tick
    }

    pub async fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.ctx.state.lock().await.slots.get(index).map(|s| s.state)
    }

    pub async fn occupied_slots(&self) -> usize {
        self.ctx.state.lock().await.slots.occupied_count()
    }

    /// Bind the listening socket and spawn the accept task
    pub async fn start(&mut self) -> ServerResult<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let bind_addr = self.ctx.config.bind_addr();
        let listener = Listener::bind(bind_addr, self.ctx.config.backlog)
            .map_err(|e| ServerError::BindFailed(format!("{bind_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        tracing::info!(
            "session '{}' listening on {} ({} slots)",
            self.ctx.session_name,
            local_addr,
            self.ctx.config.max_slots
        );

        let _ = self
            .ctx
            .event_tx
            .send(ServerEvent::Started {
                bind_addr: local_addr,
            })
            .await;

        let ctx = self.ctx.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut shutdown = ctx.shutdown.clone();
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((socket, addr)) => {
                            tracing::debug!("inbound connection from {addr}");
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                handle_client(socket, addr, ctx).await;
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }

            // Slots were already closed by stop(); the listener goes last.
            drop(listener);
            running.store(false, Ordering::SeqCst);
            let _ = ctx.event_tx.send(ServerEvent::Stopped).await;
        });

        Ok(local_addr)
    }

    /// Serialize once and send to every Ready slot; partial failures only
    /// disconnect the failing slot.
    pub async fn broadcast(&self, message: &Message) -> ServerResult<()> {
        self.ctx.broadcast(message).await?;
        Ok(())
    }

    /// Relay a chat line from the host to all Ready slots
    pub async fn send_chat(&self, text: &str) -> ServerResult<()> {
        self.broadcast(&Message::Text {
            text: text.to_string(),
            sender: self.ctx.host_player.name.clone(),
            team: self.ctx.host_player.team,
        })
        .await
    }

    /// Close the lobby: every Connected slot becomes Ready and receives the
    /// launch broadcast.
    pub async fn launch_game(&self) -> ServerResult<Vec<usize>> {
        let promoted: Vec<usize> = {
            let mut state = self.ctx.state.lock().await;
            state.launched = true;
            let mut promoted = Vec::new();
            for slot in state.slots.iter_mut() {
                if slot.state == SlotState::Connected {
                    slot.state = SlotState::Ready;
                    promoted.push(slot.index);
                }
            }
            promoted
        };

        self.ctx.broadcast(&Message::LaunchGame).await?;

        for &slot in &promoted {
            let _ = self.ctx.event_tx.send(ServerEvent::SlotReady { slot }).await;
        }
        tracing::info!("match launched with {} remote players", promoted.len());
        Ok(promoted)
    }

    /// The hosting simulation's own command submissions for a tick
    pub async fn submit_local(&self, tick: u32, commands: Vec<Vec<u8>>) {
        let mut state = self.ctx.state.lock().await;
        state.local_pending.entry(tick).or_default().extend(commands);
    }

    /// The hosting simulation's checksum report for a tick. Returns
    /// `OutOfSync` if it conflicts with a remote report.
    pub async fn submit_local_checksum(&self, tick: u32, checksum: u32) -> ServerResult<()> {
        let outcome = {
            let mut state = self.ctx.state.lock().await;
            if let Some(fatal_tick) = state.fatal {
                return Err(ServerError::OutOfSync { tick: fatal_tick });
            }
            let expected = state.expected_participants();
            state.sync.record(tick, Participant::Host, checksum, &expected)
        };

        match outcome {
            SyncOutcome::Mismatch { tick, reports } => {
                self.ctx.raise_out_of_sync(tick, reports).await;
                Err(ServerError::OutOfSync { tick })
            }
            SyncOutcome::Match { tick, .. } => {
                tracing::trace!("tick {tick} checksums agree");
                Ok(())
            }
            SyncOutcome::Pending => Ok(()),
        }
    }

    /// Merge all submissions for the current tick (ascending slot index,
    /// host first), broadcast the merged set, and advance the tick counter.
    ///
    /// Returns `Ok(None)` while the merge is withheld inside the laggard
    /// grace window. A Ready slot that still has not submitted when the
    /// window expires is merged as an empty submission; one that has missed
    /// `disconnect_threshold_ticks` consecutive ticks is disconnected.
    pub async fn close_tick(&self) -> ServerResult<Option<TickOutcome>> {
        let (outcome, laggard_handles) = {
            let mut state = self.ctx.state.lock().await;
            if let Some(tick) = state.fatal {
                return Err(ServerError::OutOfSync { tick });
            }

            let tick = state.tick;
            let ready = state.slots.ready_indices();
            let has_missing = ready.iter().any(|idx| {
                state
                    .submissions
                    .get(&tick)
                    .map_or(true, |per_slot| !per_slot.contains_key(idx))
            });

            if has_missing && state.grace_elapsed < self.ctx.config.grace_window_ticks {
                state.grace_elapsed += 1;
                return Ok(None);
            }

            let mut merged = state.local_pending.remove(&tick).unwrap_or_default();
            let per_slot = state.submissions.remove(&tick).unwrap_or_default();
            let mut dropped = Vec::new();

            for index in ready {
                match per_slot.get(&index) {
                    Some(commands) => {
                        merged.extend(commands.iter().cloned());
                        if let Some(slot) = state.slots.get_mut(index) {
                            slot.lag_ticks = 0;
                        }
                    }
                    None => {
                        if let Some(slot) = state.slots.get_mut(index) {
                            slot.lag_ticks += 1;
                            if slot.lag_ticks >= self.ctx.config.disconnect_threshold_ticks {
                                dropped.push(index);
                            }
                        }
                    }
                }
            }

            // Anything older than the tick just closed can never merge
            state.submissions.retain(|&t, _| t > tick);
            state.local_pending.retain(|&t, _| t > tick);
            state.tick = tick + 1;
            state.grace_elapsed = 0;

            let laggard_handles: Vec<(usize, Option<ConnectionHandle>)> = dropped
                .iter()
                .map(|&idx| (idx, state.slots.get(idx).and_then(|s| s.handle.clone())))
                .collect();

            (
                TickOutcome {
                    tick,
                    commands: merged,
                    dropped_slots: dropped,
                },
                laggard_handles,
            )
        };

        self.ctx
            .broadcast(&Message::Command {
                tick: outcome.tick,
                commands: outcome.commands.clone(),
            })
            .await?;

        for (index, handle) in laggard_handles {
            let reason = format!(
                "lagged {} ticks behind",
                self.ctx.config.disconnect_threshold_ticks
            );
            if let Some(handle) = handle {
                let _ = handle
                    .send(&Message::QuitGame {
                        reason: reason.clone(),
                    })
                    .await;
            }
            let mut state = self.ctx.state.lock().await;
            if let Some(slot) = state.slots.get_mut(index) {
                slot.disconnect();
            }
            tracing::warn!("slot {index} disconnected: {reason}");
        }

        Ok(Some(outcome))
    }

    /// Stop the session. Slots are closed before the listening socket.
    pub async fn stop(&mut self) -> ServerResult<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ServerError::NotRunning);
        }

        let targets: Vec<ConnectionHandle> = {
            let state = self.ctx.state.lock().await;
            state
                .slots
                .iter()
                .filter(|s| s.is_occupied())
                .filter_map(|s| s.handle.clone())
                .collect()
        };
        for handle in targets {
            let _ = handle
                .send(&Message::QuitGame {
                    reason: "server shutting down".to_string(),
                })
                .await;
        }
        {
            let mut state = self.ctx.state.lock().await;
            for slot in state.slots.iter_mut() {
                if slot.is_occupied() {
                    slot.disconnect();
                }
            }
        }

        // Accept task drops the listener after the slots are down
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }
}

/// One accepted connection: allocate a seat, run the intro exchange, then
/// pump frames until the peer leaves or fails.
async fn handle_client(socket: Socket, addr: SocketAddr, ctx: ServerCtx) {
    let mut conn = Connection::new(socket);

    let slot_index = {
        let mut state = ctx.state.lock().await;
        state.slots.allocate(addr)
    };

    let Some(slot_index) = slot_index else {
        let reason = "server is full".to_string();
        tracing::info!("rejecting {addr}: {reason}");
        let _ = ctx
            .event_tx
            .send(ServerEvent::ConnectionRejected {
                addr,
                reason: reason.clone(),
            })
            .await;
        conn.close(&reason).await;
        return;
    };

    let hello = match conn
        .handshake_server(
            &ctx.host_player,
            &ctx.session_name,
            slot_index,
            ctx.config.intro_timeout,
        )
        .await
    {
        Ok(hello) => hello,
        Err(e) => {
            let reason = format!("intro failed: {e}");
            {
                let mut state = ctx.state.lock().await;
                if let Some(slot) = state.slots.get_mut(slot_index) {
                    slot.reset();
                }
            }
            let _ = ctx
                .event_tx
                .send(ServerEvent::SlotDisconnected {
                    slot: slot_index,
                    reason,
                })
                .await;
            conn.close("intro failed").await;
            return;
        }
    };

    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(256);
    let handle = ConnectionHandle::new(frame_tx);
    {
        let mut state = ctx.state.lock().await;
        state
            .slots
            .connect(slot_index, hello.player.clone(), handle.clone());
    }
    let _ = ctx
        .event_tx
        .send(ServerEvent::SlotConnected {
            slot: slot_index,
            player: hello.player,
            addr,
        })
        .await;

    let reason = run_slot_loop(&mut conn, frame_rx, slot_index, &ctx).await;

    handle.mark_disconnected();
    let (name, seated) = {
        let mut state = ctx.state.lock().await;
        match state.slots.get_mut(slot_index) {
            Some(slot) => {
                let name = slot.player_name().to_string();
                let seated = slot.occupied_since;
                slot.reset();
                (name, seated)
            }
            None => ("<unknown>".to_string(), None),
        }
    };
    let _ = ctx
        .event_tx
        .send(ServerEvent::SlotDisconnected {
            slot: slot_index,
            reason: reason.clone(),
        })
        .await;
    let stats = conn.stats();
    tracing::info!(
        "slot {slot_index} ({name}) disconnected: {reason} \
         ({} msgs in, {} out, seated {:.1}s)",
        stats.messages_received,
        stats.messages_sent,
        seated.map(|t| t.elapsed().as_secs_f64()).unwrap_or(0.0)
    );
    conn.close("session ended").await;
}

async fn run_slot_loop(
    conn: &mut Connection,
    mut frame_rx: mpsc::Receiver<Bytes>,
    slot_index: usize,
    ctx: &ServerCtx,
) -> String {
    let mut shutdown = ctx.shutdown.clone();
    let mut heartbeat = tokio::time::interval(ctx.config.heartbeat_interval);
    let mut last_recv = Instant::now();

    loop {
        tokio::select! {
            result = conn.recv() => match result {
                Ok(Some(message)) => {
                    last_recv = Instant::now();
                    if let Some(reason) = dispatch_slot_message(slot_index, message, conn, ctx).await {
                        break reason;
                    }
                }
                Ok(None) => break "connection closed by peer".to_string(),
                Err(e) => break format!("receive error: {e}"),
            },
            Some(frame) = frame_rx.recv() => {
                if let Err(e) = conn.send_frame(&frame).await {
                    break format!("send error: {e}");
                }
            }
            _ = heartbeat.tick() => {
                if last_recv.elapsed() > ctx.config.keepalive_timeout {
                    break "keep-alive timeout".to_string();
                }
                if let Err(e) = conn.send(&Message::Ping { timestamp: unix_micros() }).await {
                    break format!("ping failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                // Flush queued frames (the shutdown notice) before closing
                while let Ok(frame) = frame_rx.try_recv() {
                    let _ = conn.send_frame(&frame).await;
                }
                break "server shutting down".to_string();
            }
        }
    }
}

/// Dispatch one inbound frame. Returns `Some(reason)` to disconnect the
/// slot.
async fn dispatch_slot_message(
    slot_index: usize,
    message: Message,
    conn: &mut Connection,
    ctx: &ServerCtx,
) -> Option<String> {
    match message {
        Message::Command { tick, commands } => {
            let mut state = ctx.state.lock().await;
            state
                .submissions
                .entry(tick)
                .or_default()
                .insert(slot_index, commands);
            None
        }
        Message::SyncCheck(tc) => {
            let outcome = {
                let mut state = ctx.state.lock().await;
                if state.fatal.is_some() {
                    return None;
                }
                let expected = state.expected_participants();
                state
                    .sync
                    .record(tc.tick, Participant::Slot(slot_index), tc.checksum, &expected)
            };
            if let SyncOutcome::Mismatch { tick, reports } = outcome {
                ctx.raise_out_of_sync(tick, reports).await;
            }
            None
        }
        Message::Text { text, sender, team } => {
            let _ = ctx
                .event_tx
                .send(ServerEvent::ChatReceived {
                    slot: slot_index,
                    text: text.clone(),
                    sender: sender.clone(),
                    team,
                })
                .await;
            // Relay to the other participants
            let _ = ctx.broadcast(&Message::Text { text, sender, team }).await;
            None
        }
        Message::QuitGame { reason } => Some(format!("quit: {reason}")),
        Message::Ping { timestamp } => {
            if let Err(e) = conn.send(&Message::Pong { timestamp }).await {
                return Some(format!("pong failed: {e}"));
            }
            None
        }
        Message::Pong { timestamp } => {
            let rtt = unix_micros().saturating_sub(timestamp);
            let state = ctx.state.lock().await;
            if let Some(handle) = state.slots.get(slot_index).and_then(|s| s.handle.as_ref()) {
                handle.update_rtt(rtt);
            }
            None
        }
        Message::Intro { .. } => Some("protocol violation: unexpected Intro".to_string()),
        Message::LaunchGame => Some("protocol violation: client sent LaunchGame".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client::{ClientEvent, ClientInterface};
    use std::time::Duration;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            game_port: 0,
            bind_address: Some("127.0.0.1".to_string()),
            grace_window_ticks: 0,
            disconnect_threshold_ticks: 1000,
            ..Default::default()
        }
    }

    fn host() -> PlayerInfo {
        PlayerInfo::new("host", "magic", 0)
    }

    async fn started_server(mut config: NetworkConfig, slots: usize) -> (ServerInterface, SocketAddr) {
        config.max_slots = slots;
        let mut server = ServerInterface::new(config, "skirmish".to_string(), host());
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn joined_client(addr: SocketAddr, name: &str) -> ClientInterface {
        let mut client = ClientInterface::new(
            NetworkConfig::default(),
            PlayerInfo::new(name, "tech", 1),
        );
        client.connect(addr).await.unwrap();
        client
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_three_client_lobby_and_tick_zero() {
        let (server, addr) = started_server(test_config(), 4).await;

        let client_a = joined_client(addr, "a").await;
        let client_b = joined_client(addr, "b").await;
        let client_c = joined_client(addr, "c").await;
        settle().await;

        for slot in 0..3 {
            assert_eq!(server.slot_state(slot).await, Some(SlotState::Connected));
        }

        let promoted = server.launch_game().await.unwrap();
        assert_eq!(promoted, vec![0, 1, 2]);
        settle().await;
        for slot in 0..3 {
            assert_eq!(server.slot_state(slot).await, Some(SlotState::Ready));
        }

        // Tick 0: A submits one command, B and C submit nothing
        client_a
            .send_commands(0, vec![b"moveUnit1".to_vec()])
            .await
            .unwrap();
        settle().await;

        let outcome = server.close_tick().await.unwrap().unwrap();
        assert_eq!(outcome.tick, 0);
        assert_eq!(outcome.commands, vec![b"moveUnit1".to_vec()]);
        assert!(outcome.dropped_slots.is_empty());
        assert_eq!(server.tick().await, 1);

        // All participants agree on the tick-0 checksum
        client_a.send_sync_check(0, 0xABCD).await.unwrap();
        client_b.send_sync_check(0, 0xABCD).await.unwrap();
        client_c.send_sync_check(0, 0xABCD).await.unwrap();
        settle().await;
        server.submit_local_checksum(0, 0xABCD).await.unwrap();

        // Every client received the merged broadcast for tick 0
        for client in [&client_a, &client_b, &client_c] {
            let merged = client
                .wait_tick_commands(0, Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(merged, vec![b"moveUnit1".to_vec()]);
        }
    }

    #[tokio::test]
    async fn test_merge_order_is_ascending_slot_index() {
        let (server, addr) = started_server(test_config(), 4).await;

        let client_a = joined_client(addr, "a").await;
        let client_b = joined_client(addr, "b").await;
        let client_c = joined_client(addr, "c").await;
        settle().await;
        server.launch_game().await.unwrap();
        server.submit_local(0, vec![b"host".to_vec()]).await;

        // Submit in scrambled order; the merge ignores arrival order
        client_c.send_commands(0, vec![b"c1".to_vec()]).await.unwrap();
        client_a
            .send_commands(0, vec![b"a1".to_vec(), b"a2".to_vec()])
            .await
            .unwrap();
        client_b.send_commands(0, vec![b"b1".to_vec()]).await.unwrap();
        settle().await;

        let outcome = server.close_tick().await.unwrap().unwrap();
        assert_eq!(
            outcome.commands,
            vec![
                b"host".to_vec(),
                b"a1".to_vec(),
                b"a2".to_vec(),
                b"b1".to_vec(),
                b"c1".to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn test_server_full_rejection_is_explicit() {
        let (mut server, addr) = started_server(test_config(), 1).await;
        let mut events = server.take_event_receiver().unwrap();

        let _seated = joined_client(addr, "first").await;
        settle().await;

        let mut refused = ClientInterface::new(
            NetworkConfig::default(),
            PlayerInfo::new("second", "tech", 1),
        );
        let err = refused.connect(addr).await.unwrap_err();
        assert!(err.to_string().contains("server is full"), "got: {err}");

        let mut saw_rejection = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ServerEvent::ConnectionRejected { .. }) {
                saw_rejection = true;
            }
        }
        assert!(saw_rejection);
    }

    #[tokio::test]
    async fn test_silent_connection_dropped_without_disturbing_others() {
        let mut config = test_config();
        config.intro_timeout = Duration::from_millis(200);
        let (server, addr) = started_server(config, 4).await;

        // A proper client, then a connection that never sends its intro
        let _client = joined_client(addr, "talker").await;
        let mut mute = Socket::connect(addr, Duration::from_secs(1)).await.unwrap();
        settle().await;
        assert_eq!(server.occupied_slots().await, 2);

        tokio::time::sleep(Duration::from_millis(400)).await;

        // The mute seat was reclaimed; the talker is untouched
        assert_eq!(server.occupied_slots().await, 1);
        assert_eq!(server.slot_state(0).await, Some(SlotState::Connected));
        mute.close().await;
    }

    #[tokio::test]
    async fn test_broadcast_survives_one_dead_slot() {
        let (server, addr) = started_server(test_config(), 4).await;

        let mut client_a = joined_client(addr, "a").await;
        let mut events_a = client_a.take_event_receiver().unwrap();
        let client_b = joined_client(addr, "b").await;

        // Third participant joins by hand so its socket can die abruptly
        let mut raw = Connection::new(Socket::connect(addr, Duration::from_secs(1)).await.unwrap());
        raw.handshake_client(&PlayerInfo::new("doomed", "tech", 1), Duration::from_secs(1))
            .await
            .unwrap();
        settle().await;
        server.launch_game().await.unwrap();
        settle().await;

        // Abrupt close: no quit notice, the server finds out via EOF
        drop(raw);
        settle().await;

        server.send_chat("still with me?").await.unwrap();
        settle().await;

        let mut got_chat = false;
        while let Ok(event) = events_a.try_recv() {
            if let ClientEvent::ChatReceived { text, .. } = event {
                got_chat = got_chat || text == "still with me?";
            }
        }
        assert!(got_chat);
        // The two healthy clients still hold their seats
        assert_eq!(server.occupied_slots().await, 2);
        drop(client_b);
    }

    #[tokio::test]
    async fn test_laggard_policy_at_threshold_boundary() {
        let mut config = test_config();
        config.disconnect_threshold_ticks = 2;
        let (server, addr) = started_server(config, 4).await;

        let client_a = joined_client(addr, "prompt").await;
        let _client_b = joined_client(addr, "laggard").await;
        settle().await;
        server.launch_game().await.unwrap();
        settle().await;

        // Tick 0: laggard misses once - within threshold, merged as empty
        client_a.send_commands(0, vec![b"a0".to_vec()]).await.unwrap();
        settle().await;
        let outcome = server.close_tick().await.unwrap().unwrap();
        assert_eq!(outcome.commands, vec![b"a0".to_vec()]);
        assert!(outcome.dropped_slots.is_empty());
        assert_eq!(server.slot_state(1).await, Some(SlotState::Ready));

        // Tick 1: second consecutive miss reaches the threshold - dropped
        client_a.send_commands(1, vec![b"a1".to_vec()]).await.unwrap();
        settle().await;
        let outcome = server.close_tick().await.unwrap().unwrap();
        assert_eq!(outcome.dropped_slots, vec![1]);
        assert_ne!(server.slot_state(1).await, Some(SlotState::Ready));
    }

    #[tokio::test]
    async fn test_grace_window_withholds_merge() {
        let mut config = test_config();
        config.grace_window_ticks = 1;
        let (server, addr) = started_server(config, 4).await;

        let client = joined_client(addr, "slow").await;
        settle().await;
        server.launch_game().await.unwrap();
        settle().await;

        // Nothing submitted yet: the merge is withheld once
        assert!(server.close_tick().await.unwrap().is_none());
        assert_eq!(server.tick().await, 0);

        client.send_commands(0, vec![b"late".to_vec()]).await.unwrap();
        settle().await;
        let outcome = server.close_tick().await.unwrap().unwrap();
        assert_eq!(outcome.commands, vec![b"late".to_vec()]);
        assert_eq!(server.tick().await, 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_terminates_session() {
        let (mut server, addr) = started_server(test_config(), 4).await;
        let mut events = server.take_event_receiver().unwrap();

        let client_a = joined_client(addr, "a").await;
        let mut client_b = joined_client(addr, "b").await;
        let mut events_b = client_b.take_event_receiver().unwrap();
        settle().await;
        server.launch_game().await.unwrap();
        settle().await;

        client_a.send_sync_check(5, 0xAAAA).await.unwrap();
        client_b.send_sync_check(5, 0xBBBB).await.unwrap();
        settle().await;

        let mut saw_out_of_sync = false;
        while let Ok(event) = events.try_recv() {
            if let ServerEvent::OutOfSync { tick } = event {
                assert_eq!(tick, 5);
                saw_out_of_sync = true;
            }
        }
        assert!(saw_out_of_sync);

        // The session is dead: tick processing refuses to continue
        assert!(matches!(
            server.close_tick().await,
            Err(ServerError::OutOfSync { tick: 5 })
        ));

        // Remaining participants were told to quit
        settle().await;
        let mut b_disconnected = false;
        while let Ok(event) = events_b.try_recv() {
            if let ClientEvent::Disconnected { reason } = event {
                assert!(reason.contains("out of sync"), "got: {reason}");
                b_disconnected = true;
            }
        }
        assert!(b_disconnected);
    }

    #[tokio::test]
    async fn test_stop_emits_stopped_and_closes_slots() {
        let (mut server, addr) = started_server(test_config(), 4).await;
        let mut events = server.take_event_receiver().unwrap();

        let mut client = joined_client(addr, "a").await;
        let mut client_events = client.take_event_receiver().unwrap();
        settle().await;

        server.stop().await.unwrap();
        settle().await;

        let mut stopped = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ServerEvent::Stopped) {
                stopped = true;
            }
        }
        assert!(stopped);
        assert!(!server.is_running());

        let mut client_told = false;
        while let Ok(event) = client_events.try_recv() {
            if let ClientEvent::Disconnected { reason } = event {
                assert!(reason.contains("shutting down"), "got: {reason}");
                client_told = true;
            }
        }
        assert!(client_told);
    }
}
