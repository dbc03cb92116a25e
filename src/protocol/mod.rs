//! Protocol module - Defines the wire protocol for game session traffic
//!
//! Every message travels as one self-delimited frame:
//! - 1 byte message type
//! - 4 bytes payload length (big-endian)
//! - Variable length payload (bincode-encoded message body)

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Protocol version for compatibility checking during the intro exchange
pub const PROTOCOL_VERSION: u32 = 1;

/// Default TCP port for the authoritative game session
pub const GAME_PORT: u16 = 61357;

/// Default UDP port for LAN discovery broadcasts (distinct from the game port)
pub const DISCOVERY_PORT: u16 = 61358;

/// Magic marker prefixing discovery datagrams
pub const DISCOVERY_MAGIC: [u8; 4] = [0x53, 0x54, 0x52, 0x4E]; // "STRN"
