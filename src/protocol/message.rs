//! Protocol message definitions
//!
//! Defines the closed set of messages exchanged between the authoritative
//! server and its clients. Command payloads are opaque to this layer; the
//! simulation encodes and decodes them on either side.

use serde::{Deserialize, Serialize};

/// Identity a participant presents during the intro exchange.
///
/// Faction and team are carried for the lobby's benefit; the network core
/// never interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Human-readable player name
    pub name: String,
    /// Faction identifier (opaque)
    pub faction: String,
    /// Team index, -1 when unassigned
    pub team: i8,
}

impl PlayerInfo {
    pub fn new(name: impl Into<String>, faction: impl Into<String>, team: i8) -> Self {
        Self {
            name: name.into(),
            faction: faction.into(),
            team,
        }
    }
}

/// One participant's checksum over deterministic simulation state for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickChecksum {
    /// Simulation tick the checksum was computed at
    pub tick: u32,
    /// 32-bit state checksum
    pub checksum: u32,
}

/// All protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Identity exchange, sent by the server on accept and echoed by the
    /// client. The server fills `slot_index` with the assigned slot; a
    /// client sends -1.
    Intro {
        protocol_version: u32,
        player: PlayerInfo,
        /// Session name on the server side, client hostname otherwise
        session: String,
        slot_index: i8,
    },

    /// Server signal that the lobby is closed and the match begins
    LaunchGame,

    /// A command list for one tick. Client to server: the slot's local
    /// submissions. Server to clients: the merged, globally-ordered set.
    Command {
        tick: u32,
        commands: Vec<Vec<u8>>,
    },

    /// Chat text relayed through the server
    Text {
        text: String,
        sender: String,
        team: i8,
    },

    /// Graceful departure or session termination
    QuitGame {
        reason: String,
    },

    /// Per-tick state checksum for desync detection
    SyncCheck(TickChecksum),

    /// Keep-alive probe
    Ping {
        timestamp: u64,
    },

    /// Keep-alive response
    Pong {
        timestamp: u64,
    },
}

impl Message {
    /// Get the wire type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Intro { .. } => 0x01,
            Message::LaunchGame => 0x02,
            Message::Command { .. } => 0x03,
            Message::Text { .. } => 0x04,
            Message::QuitGame { .. } => 0x05,
            Message::SyncCheck(_) => 0x06,
            Message::Ping { .. } => 0x07,
            Message::Pong { .. } => 0x08,
        }
    }

    /// Whether `id` names a message in the closed set
    pub fn is_known_type(id: u8) -> bool {
        (0x01..=0x08).contains(&id)
    }

    /// Check if this message carries lockstep state (commands or checksums)
    pub fn is_lockstep(&self) -> bool {
        matches!(self, Message::Command { .. } | Message::SyncCheck(_))
    }
}
