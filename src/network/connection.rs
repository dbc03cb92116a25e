//! Connection handling
//!
//! One framed connection over a [`Socket`]: encoding/decoding, the intro
//! handshake, keep-alive pings, and a clonable handle for queueing outgoing
//! frames from other tasks.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

use super::socket::{Socket, SocketError};
use crate::protocol::{CodecError, Decoder, Encoder, Message, PlayerInfo, PROTOCOL_VERSION};

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("connection closed")]
    Closed,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("connection timeout")]
    Timeout,

    #[error("send channel closed")]
    SendChannelClosed,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// State of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport established, intro exchange pending
    Connecting,
    /// Intro exchange complete
    Connected,
    /// Connection is closing or closed
    Closed,
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt_us: u64,
}

/// A framed connection to a remote participant
pub struct Connection {
    remote_addr: SocketAddr,
    socket: Socket,
    encoder: Encoder,
    decoder: Decoder,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Remote identity, populated by the handshake
    remote_player: Option<PlayerInfo>,
    state: ConnectionState,
    stats: ConnectionStats,
}

/// What the server-side handshake learned about the client
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub player: PlayerInfo,
}

/// What the client-side handshake learned about the server
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub session: String,
    pub slot_index: i8,
}

impl Connection {
    /// Wrap an established socket
    pub fn new(socket: Socket) -> Self {
        let remote_addr = socket.peer_addr();
        Self {
            remote_addr,
            socket,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            remote_player: None,
            state: ConnectionState::Connecting,
            stats: ConnectionStats::default(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn remote_player(&self) -> Option<&PlayerInfo> {
        self.remote_player.as_ref()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Server side of the intro exchange. The server speaks first: it sends
    /// its own intro carrying the session name and the assigned slot, then
    /// waits up to `intro_timeout` for the client's intro. A client that
    /// sends anything else first, or the wrong protocol version, is refused.
    pub async fn handshake_server(
        &mut self,
        host: &PlayerInfo,
        session: &str,
        slot_index: usize,
        intro_timeout: Duration,
    ) -> ConnectionResult<ClientHello> {
        self.send(&Message::Intro {
            protocol_version: PROTOCOL_VERSION,
            player: host.clone(),
            session: session.to_string(),
            slot_index: slot_index as i8,
        })
        .await?;

        let message = self
            .recv_timeout(intro_timeout)
            .await?
            .ok_or_else(|| ConnectionError::HandshakeFailed("closed during intro".to_string()))?;

        let (remote_version, player) = match message {
            Message::Intro {
                protocol_version,
                player,
                ..
            } => (protocol_version, player),
            Message::QuitGame { reason } => return Err(ConnectionError::Rejected(reason)),
            other => {
                return Err(ConnectionError::HandshakeFailed(format!(
                    "expected Intro, got type {:#04x}",
                    other.type_id()
                )));
            }
        };

        if remote_version != PROTOCOL_VERSION {
            let _ = self
                .send(&Message::QuitGame {
                    reason: format!(
                        "protocol version mismatch: server speaks {}, client speaks {}",
                        PROTOCOL_VERSION, remote_version
                    ),
                })
                .await;
            return Err(ConnectionError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version,
            });
        }

        tracing::info!(
            "intro complete: '{}' ({}) in slot {}",
            player.name,
            self.remote_addr,
            slot_index
        );

        self.remote_player = Some(player.clone());
        self.state = ConnectionState::Connected;
        Ok(ClientHello { player })
    }

    /// Client side of the intro exchange: wait for the server's intro,
    /// validate the version, answer with our own identity.
    pub async fn handshake_client(
        &mut self,
        local: &PlayerInfo,
        intro_timeout: Duration,
    ) -> ConnectionResult<ServerHello> {
        let message = self
            .recv_timeout(intro_timeout)
            .await?
            .ok_or_else(|| ConnectionError::HandshakeFailed("closed during intro".to_string()))?;

        let (remote_version, server_player, session, slot_index) = match message {
            Message::Intro {
                protocol_version,
                player,
                session,
                slot_index,
            } => (protocol_version, player, session, slot_index),
            Message::QuitGame { reason } => return Err(ConnectionError::Rejected(reason)),
            other => {
                return Err(ConnectionError::HandshakeFailed(format!(
                    "expected Intro, got type {:#04x}",
                    other.type_id()
                )));
            }
        };

        if remote_version != PROTOCOL_VERSION {
            return Err(ConnectionError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version,
            });
        }

        self.send(&Message::Intro {
            protocol_version: PROTOCOL_VERSION,
            player: local.clone(),
            session: String::new(),
            slot_index: -1,
        })
        .await?;

        tracing::info!(
            "joined session '{}' hosted by '{}' as slot {}",
            session,
            server_player.name,
            slot_index
        );

        self.remote_player = Some(server_player);
        self.state = ConnectionState::Connected;
        Ok(ServerHello {
            session,
            slot_index,
        })
    }

    /// Send a message
    pub async fn send(&mut self, message: &Message) -> ConnectionResult<()> {
        self.write_buf.clear();
        self.encoder.encode(message, &mut self.write_buf)?;

        let len = self.write_buf.len();
        let frame = self.write_buf.split().freeze();
        self.socket.send_all(&frame).await?;

        self.stats.messages_sent += 1;
        self.stats.bytes_sent += len as u64;
        Ok(())
    }

    /// Send a frame that was already encoded (broadcasts serialize once)
    pub async fn send_frame(&mut self, frame: &Bytes) -> ConnectionResult<()> {
        self.socket.send_all(frame).await?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    /// Receive the next message. Returns `None` on clean peer shutdown.
    pub async fn recv(&mut self) -> ConnectionResult<Option<Message>> {
        loop {
            if let Some(message) = self.decoder.decode(&mut self.read_buf)? {
                self.stats.messages_received += 1;
                return Ok(Some(message));
            }

            let mut buf = [0u8; 4096];
            let n = self.socket.recv(&mut buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                // Peer shut down mid-frame
                return Err(ConnectionError::Closed);
            }

            self.read_buf.extend_from_slice(&buf[..n]);
            self.stats.bytes_received += n as u64;
        }
    }

    /// Receive with a bound on how long to wait
    pub async fn recv_timeout(&mut self, timeout: Duration) -> ConnectionResult<Option<Message>> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout),
        }
    }

    /// Send a ping and wait for the matching pong
    pub async fn ping(&mut self) -> ConnectionResult<Duration> {
        let timestamp = unix_micros();
        let start = Instant::now();

        self.send(&Message::Ping { timestamp }).await?;

        let message = self
            .recv_timeout(Duration::from_secs(5))
            .await?
            .ok_or(ConnectionError::Closed)?;

        match message {
            Message::Pong { timestamp: ts } if ts == timestamp => {
                let rtt = start.elapsed();
                self.stats.rtt_us = rtt.as_micros() as u64;
                Ok(rtt)
            }
            _ => Err(ConnectionError::HandshakeFailed(
                "unexpected reply to ping".to_string(),
            )),
        }
    }

    /// Close the connection: best-effort quit notice, then shutdown. The
    /// socket is closed whether or not the notice went out.
    pub async fn close(&mut self, reason: &str) {
        if self.state != ConnectionState::Closed {
            let _ = self
                .send(&Message::QuitGame {
                    reason: reason.to_string(),
                })
                .await;
        }
        self.socket.close().await;
        self.state = ConnectionState::Closed;
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, ConnectionState::Connected)
    }
}

pub(crate) fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A handle for queueing frames to a connection from other tasks
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Bytes>,
    connected: Arc<AtomicBool>,
    rtt_us: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Bytes>) -> Self {
        Self {
            sender,
            connected: Arc::new(AtomicBool::new(true)),
            rtt_us: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Encode and queue a message
    pub async fn send(&self, message: &Message) -> ConnectionResult<()> {
        let frame = Encoder::new().encode_to_vec(message)?;
        self.send_frame(Bytes::from(frame)).await
    }

    /// Queue an already-encoded frame
    pub async fn send_frame(&self, frame: Bytes) -> ConnectionResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        self.sender
            .send(frame)
            .await
            .map_err(|_| ConnectionError::SendChannelClosed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn rtt_us(&self) -> u64 {
        self.rtt_us.load(Ordering::SeqCst)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn update_rtt(&self, rtt_us: u64) {
        self.rtt_us.store(rtt_us, Ordering::SeqCst);
    }
}
