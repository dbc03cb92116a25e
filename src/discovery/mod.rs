//! LAN session discovery
//!
//! A small UDP broadcast protocol, separate from the TCP game link. Hosts
//! run a responder on the discovery port; joiners broadcast a probe and
//! collect announces. Datagrams carry a 4-byte magic marker followed by a
//! bincode body; anything without the marker is ignored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};

use crate::protocol::{DISCOVERY_MAGIC, DISCOVERY_PORT, PROTOCOL_VERSION};

const MAX_DATAGRAM: usize = 1024;
/// Unsolicited announce cadence while hosting
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3);

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("responder already running")]
    AlreadyRunning,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// What a host announces about its session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Stable identifier for this hosting instance, survives re-announces
    pub session_id: String,
    pub session: String,
    pub host: String,
    pub game_port: u16,
    pub occupied_slots: usize,
    pub max_slots: usize,
    /// A launched session is visible but not joinable
    pub launched: bool,
}

#[derive(Debug, Serialize, Deserialize)]
enum DiscoveryMessage {
    Probe { protocol_version: u32 },
    Announce { protocol_version: u32, info: SessionInfo },
}

/// A session found on the LAN
#[derive(Debug, Clone)]
pub struct DiscoveredSession {
    /// TCP address to join (announcing host, announced game port)
    pub addr: SocketAddr,
    pub info: SessionInfo,
}

fn encode_datagram(message: &DiscoveryMessage) -> DiscoveryResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&DISCOVERY_MAGIC);
    bincode::serialize_into(&mut buf, message)?;
    Ok(buf)
}

fn decode_datagram(data: &[u8]) -> Option<DiscoveryMessage> {
    let body = data.strip_prefix(&DISCOVERY_MAGIC[..])?;
    bincode::deserialize(body).ok()
}

/// Host-side responder: answers probes and periodically announces.
pub struct DiscoveryResponder {
    info: Arc<Mutex<SessionInfo>>,
    port: u16,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl DiscoveryResponder {
    pub fn new(info: SessionInfo) -> Self {
        Self {
            info: Arc::new(Mutex::new(info)),
            port: DISCOVERY_PORT,
            shutdown_tx: None,
        }
    }

    /// Override the discovery port (tests use an ephemeral one)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Keep the announce current as slots fill up or the match launches
    pub async fn update_info(&self, info: SessionInfo) {
        *self.info.lock().await = info;
    }

    /// Bind the discovery socket and spawn the responder task. Returns the
    /// actual bound port.
    pub async fn start(&mut self) -> DiscoveryResult<u16> {
        if self.shutdown_tx.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        socket.set_broadcast(true)?;
        let port = socket.local_addr()?.port();
        tracing::info!("discovery responder listening on udp port {port}");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        let info = self.info.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let mut announce = tokio::time::interval(ANNOUNCE_INTERVAL);
            let broadcast_addr = SocketAddr::from((Ipv4Addr::BROADCAST, port));

            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (n, from) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!("discovery recv error: {e}");
                                continue;
                            }
                        };
                        match decode_datagram(&buf[..n]) {
                            Some(DiscoveryMessage::Probe { protocol_version })
                                if protocol_version == PROTOCOL_VERSION =>
                            {
                                let reply = DiscoveryMessage::Announce {
                                    protocol_version: PROTOCOL_VERSION,
                                    info: info.lock().await.clone(),
                                };
                                match encode_datagram(&reply) {
                                    Ok(datagram) => {
                                        if let Err(e) = socket.send_to(&datagram, from).await {
                                            tracing::warn!("announce to {from} failed: {e}");
                                        }
                                    }
                                    Err(e) => tracing::error!("announce encode failed: {e}"),
                                }
                            }
                            Some(DiscoveryMessage::Probe { protocol_version }) => {
                                tracing::debug!(
                                    "ignoring probe from {from} with protocol {protocol_version}"
                                );
                            }
                            // Our own announces echo back over broadcast
                            Some(DiscoveryMessage::Announce { .. }) => {}
                            None => {
                                tracing::trace!("ignoring {n}-byte datagram from {from}");
                            }
                        }
                    }
                    _ = announce.tick() => {
                        let message = DiscoveryMessage::Announce {
                            protocol_version: PROTOCOL_VERSION,
                            info: info.lock().await.clone(),
                        };
                        if let Ok(datagram) = encode_datagram(&message) {
                            let _ = socket.send_to(&datagram, broadcast_addr).await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("discovery responder stopped");
        });

        Ok(port)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Drop for DiscoveryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Events from the session watcher
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A session was seen for the first time
    SessionDiscovered(DiscoveredSession),
    /// A known session re-announced with changed details
    SessionUpdated(DiscoveredSession),
    /// A session stopped announcing (by session_id)
    SessionLost(String),
}

/// Probe cadence for the continuous watcher
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// A session silent for this long is considered gone
const LOST_AFTER: Duration = Duration::from_secs(10);

/// Continuously watches the LAN for sessions, keeping a live map keyed by
/// session id and reporting changes over an event channel.
pub struct SessionWatcher {
    target: SocketAddr,
    sessions: Arc<Mutex<HashMap<String, (DiscoveredSession, Instant)>>>,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    event_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl SessionWatcher {
    pub fn new() -> Self {
        Self::with_target(SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)))
    }

    /// Probe a specific discovery address instead of the LAN broadcast
    pub fn with_target(target: SocketAddr) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            target,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx: None,
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.event_rx.take()
    }

    /// Snapshot of the currently known sessions
    pub async fn sessions(&self) -> Vec<DiscoveredSession> {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|(s, _)| s.clone()).collect()
    }

    pub async fn start(&mut self) -> DiscoveryResult<()> {
        if self.shutdown_tx.is_some() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let target = self.target;
        let sessions = self.sessions.clone();
        let event_tx = self.event_tx.clone();
        let probe = encode_datagram(&DiscoveryMessage::Probe {
            protocol_version: PROTOCOL_VERSION,
        })?;

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            let mut probe_timer = tokio::time::interval(PROBE_INTERVAL);

            loop {
                tokio::select! {
                    _ = probe_timer.tick() => {
                        if let Err(e) = socket.send_to(&probe, target).await {
                            tracing::warn!("discovery probe failed: {e}");
                        }
                        // Reap sessions that stopped announcing
                        let mut lost = Vec::new();
                        {
                            let mut sessions = sessions.lock().await;
                            sessions.retain(|id, (_, last_seen)| {
                                if last_seen.elapsed() > LOST_AFTER {
                                    lost.push(id.clone());
                                    false
                                } else {
                                    true
                                }
                            });
                        }
                        for id in lost {
                            tracing::debug!("session {id} lost");
                            let _ = event_tx.send(DiscoveryEvent::SessionLost(id)).await;
                        }
                    }
                    result = socket.recv_from(&mut buf) => {
                        let (n, from) = match result {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::warn!("discovery recv error: {e}");
                                continue;
                            }
                        };
                        let Some(DiscoveryMessage::Announce { protocol_version, info }) =
                            decode_datagram(&buf[..n])
                        else {
                            continue;
                        };
                        if protocol_version != PROTOCOL_VERSION {
                            continue;
                        }

                        let found = DiscoveredSession {
                            addr: SocketAddr::new(from.ip(), info.game_port),
                            info,
                        };
                        let event = {
                            let mut sessions = sessions.lock().await;
                            let id = found.info.session_id.clone();
                            match sessions.insert(id, (found.clone(), Instant::now())) {
                                None => Some(DiscoveryEvent::SessionDiscovered(found)),
                                Some((previous, _)) if previous.info != found.info => {
                                    Some(DiscoveryEvent::SessionUpdated(found))
                                }
                                Some(_) => None,
                            }
                        };
                        if let Some(event) = event {
                            let _ = event_tx.send(event).await;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("session watcher stopped");
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl Default for SessionWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Broadcast a probe on the LAN and collect announces until `timeout`.
/// Sessions are deduplicated by announcing host.
pub async fn discover(timeout: Duration) -> DiscoveryResult<Vec<DiscoveredSession>> {
    discover_at(
        SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
        timeout,
    )
    .await
}

/// Probe a specific discovery address (broadcast or unicast)
pub async fn discover_at(
    target: SocketAddr,
    timeout: Duration,
) -> DiscoveryResult<Vec<DiscoveredSession>> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let probe = encode_datagram(&DiscoveryMessage::Probe {
        protocol_version: PROTOCOL_VERSION,
    })?;
    socket.send_to(&probe, target).await?;

    let mut found: HashMap<String, DiscoveredSession> = HashMap::new();
    let mut buf = [0u8; MAX_DATAGRAM];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (n, from) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                tracing::warn!("discovery recv error: {e}");
                continue;
            }
            Err(_) => break,
        };

        if let Some(DiscoveryMessage::Announce {
            protocol_version,
            info,
        }) = decode_datagram(&buf[..n])
        {
            if protocol_version != PROTOCOL_VERSION {
                continue;
            }
            let addr = SocketAddr::new(from.ip(), info.game_port);
            tracing::debug!("found session '{}' at {addr}", info.session);
            found.insert(info.session_id.clone(), DiscoveredSession { addr, info });
        }
    }

    let mut sessions: Vec<DiscoveredSession> = found.into_values().collect();
    sessions.sort_by(|a, b| a.info.session.cmp(&b.info.session));
    Ok(sessions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(session: &str) -> SessionInfo {
        SessionInfo {
            session_id: format!("id-{session}"),
            session: session.to_string(),
            host: "host".to_string(),
            game_port: 61357,
            occupied_slots: 1,
            max_slots: 8,
            launched: false,
        }
    }

    #[test]
    fn test_datagram_roundtrip_and_magic() {
        let message = DiscoveryMessage::Announce {
            protocol_version: PROTOCOL_VERSION,
            info: info("lan party"),
        };
        let datagram = encode_datagram(&message).unwrap();
        assert_eq!(&datagram[..4], &DISCOVERY_MAGIC[..]);

        match decode_datagram(&datagram) {
            Some(DiscoveryMessage::Announce { info: decoded, .. }) => {
                assert_eq!(decoded, info("lan party"));
            }
            other => panic!("unexpected: {other:?}"),
        }

        // Wrong or missing magic is silently ignored
        assert!(decode_datagram(b"nope").is_none());
        assert!(decode_datagram(&datagram[1..]).is_none());
        assert!(decode_datagram(&[]).is_none());
    }

    #[tokio::test]
    async fn test_probe_gets_announce() {
        let mut responder = DiscoveryResponder::new(info("skirmish")).with_port(0);
        let port = responder.start().await.unwrap();

        let target = SocketAddr::from(([127, 0, 0, 1], port));
        let sessions = discover_at(target, Duration::from_millis(500)).await.unwrap();

        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].info.session, "skirmish");
        assert_eq!(sessions[0].addr.port(), 61357);
        responder.stop();
    }

    #[tokio::test]
    async fn test_responder_survives_garbage_and_updates() {
        let mut responder = DiscoveryResponder::new(info("before")).with_port(0);
        let port = responder.start().await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], port));

        // Garbage first; the responder must keep serving probes after it
        let noise = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        noise.send_to(b"\xff\xff\xff\xff", target).await.unwrap();

        let mut updated = info("after");
        updated.occupied_slots = 3;
        responder.update_info(updated).await;

        let sessions = discover_at(target, Duration::from_millis(500)).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].info.session, "after");
        assert_eq!(sessions[0].info.occupied_slots, 3);
    }

    #[tokio::test]
    async fn test_watcher_reports_discovery_and_updates() {
        let mut responder = DiscoveryResponder::new(info("open")).with_port(0);
        let port = responder.start().await.unwrap();

        let mut watcher = SessionWatcher::with_target(SocketAddr::from(([127, 0, 0, 1], port)));
        let mut events = watcher.take_event_receiver().unwrap();
        watcher.start().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DiscoveryEvent::SessionDiscovered(found) => {
                assert_eq!(found.info.session, "open");
                assert_eq!(found.addr.port(), 61357);
            }
            other => panic!("expected discovery, got {other:?}"),
        }

        // Same session id with new details: the next probe reports an update
        let mut fuller = info("open");
        fuller.occupied_slots = 5;
        responder.update_info(fuller).await;

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DiscoveryEvent::SessionUpdated(found) => {
                assert_eq!(found.info.occupied_slots, 5);
            }
            other => panic!("expected update, got {other:?}"),
        }

        assert_eq!(watcher.sessions().await.len(), 1);
        watcher.stop();
        responder.stop();
    }

    #[tokio::test]
    async fn test_stale_probe_version_ignored() {
        let mut responder = DiscoveryResponder::new(info("current")).with_port(0);
        let port = responder.start().await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], port));

        let probe = encode_datagram(&DiscoveryMessage::Probe {
            protocol_version: PROTOCOL_VERSION + 1,
        })
        .unwrap();
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        socket.send_to(&probe, target).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let reply = tokio::time::timeout(
            Duration::from_millis(300),
            socket.recv_from(&mut buf),
        )
        .await;
        assert!(reply.is_err(), "version-mismatched probe must get no reply");
        responder.stop();
    }
}
