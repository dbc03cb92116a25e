//! Connection slots
//!
//! A slot is one server-side seat for a client. The table has fixed
//! capacity; a disconnected slot is reset to empty and its index reused.

use std::net::SocketAddr;
use std::time::Instant;

use super::connection::ConnectionHandle;
use crate::protocol::PlayerInfo;

/// Hard cap on slot capacity
pub const MAX_SLOTS: usize = 8;

/// Per-slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Unoccupied, no socket
    Empty,
    /// Connection accepted, intro exchange pending
    Connecting,
    /// Intro validated, in the lobby
    Connected,
    /// Match launched, participating in lockstep
    Ready,
    /// Tearing down; reset to Empty once the reader task exits
    Disconnected,
}

/// One server-side seat
#[derive(Debug)]
pub struct Slot {
    pub index: usize,
    pub state: SlotState,
    pub player: Option<PlayerInfo>,
    pub addr: Option<SocketAddr>,
    pub handle: Option<ConnectionHandle>,
    /// Consecutive ticks closed without a submission from this slot
    pub lag_ticks: u32,
    pub occupied_since: Option<Instant>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Empty,
            player: None,
            addr: None,
            handle: None,
            lag_ticks: 0,
            occupied_since: None,
        }
    }

    /// Socket is valid exactly in these states
    pub fn is_occupied(&self) -> bool {
        matches!(
            self.state,
            SlotState::Connecting | SlotState::Connected | SlotState::Ready
        )
    }

    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Ready
    }

    /// Begin teardown. The handle stops accepting frames immediately.
    pub fn disconnect(&mut self) {
        if let Some(handle) = &self.handle {
            handle.mark_disconnected();
        }
        self.state = SlotState::Disconnected;
    }

    /// Return the seat to the pool
    pub fn reset(&mut self) {
        if let Some(handle) = &self.handle {
            handle.mark_disconnected();
        }
        *self = Slot::new(self.index);
    }

    /// Display name for lifecycle events
    pub fn player_name(&self) -> &str {
        self.player.as_ref().map_or("<unknown>", |p| p.name.as_str())
    }
}

/// Fixed-capacity table of seats
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_SLOTS);
        Self {
            slots: (0..capacity).map(Slot::new).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim the first empty seat for a freshly accepted connection.
    /// Returns `None` when capacity is exhausted.
    pub fn allocate(&mut self, addr: SocketAddr) -> Option<usize> {
        let slot = self.slots.iter_mut().find(|s| s.state == SlotState::Empty)?;
        slot.state = SlotState::Connecting;
        slot.addr = Some(addr);
        slot.occupied_since = Some(Instant::now());
        Some(slot.index)
    }

    /// Promote a slot once its intro exchange completed
    pub fn connect(&mut self, index: usize, player: PlayerInfo, handle: ConnectionHandle) {
        let slot = &mut self.slots[index];
        debug_assert_eq!(slot.state, SlotState::Connecting);
        slot.state = SlotState::Connected;
        slot.player = Some(player);
        slot.handle = Some(handle);
    }

    pub fn get(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// Indices of Ready slots, ascending. This order is the command merge
    /// order, so it must be deterministic.
    pub fn ready_indices(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.is_ready())
            .map(|s| s.index)
            .collect()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_occupied()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(1);
        ConnectionHandle::new(tx)
    }

    #[test]
    fn test_allocate_fills_lowest_empty_first() {
        let mut table = SlotTable::new(4);
        assert_eq!(table.allocate(addr()), Some(0));
        assert_eq!(table.allocate(addr()), Some(1));

        // Free slot 0; the next allocation reuses it
        table.get_mut(0).unwrap().reset();
        assert_eq!(table.allocate(addr()), Some(0));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let mut table = SlotTable::new(2);
        assert!(table.allocate(addr()).is_some());
        assert!(table.allocate(addr()).is_some());
        assert!(table.allocate(addr()).is_none());
    }

    #[test]
    fn test_capacity_clamped_to_hard_cap() {
        let table = SlotTable::new(64);
        assert_eq!(table.capacity(), MAX_SLOTS);
        let table = SlotTable::new(0);
        assert_eq!(table.capacity(), 1);
    }

    #[test]
    fn test_lifecycle_and_reuse() {
        let mut table = SlotTable::new(2);
        let idx = table.allocate(addr()).unwrap();
        assert_eq!(table.get(idx).unwrap().state, SlotState::Connecting);

        table.connect(idx, PlayerInfo::new("alice", "tech", 0), handle());
        assert_eq!(table.get(idx).unwrap().state, SlotState::Connected);
        assert!(table.get(idx).unwrap().is_occupied());

        table.get_mut(idx).unwrap().state = SlotState::Ready;
        assert_eq!(table.ready_indices(), vec![idx]);

        table.get_mut(idx).unwrap().disconnect();
        assert!(!table.get(idx).unwrap().is_occupied());

        table.get_mut(idx).unwrap().reset();
        assert_eq!(table.get(idx).unwrap().state, SlotState::Empty);
        assert!(table.get(idx).unwrap().player.is_none());
        assert_eq!(table.allocate(addr()), Some(idx));
    }

    #[test]
    fn test_seat_metadata_set_on_allocate_and_cleared_on_reset() {
        let mut table = SlotTable::new(2);
        let idx = table.allocate(addr()).unwrap();
        assert!(table.get(idx).unwrap().occupied_since.is_some());
        assert_eq!(table.get(idx).unwrap().player_name(), "<unknown>");

        table.connect(idx, PlayerInfo::new("bob", "magic", 1), handle());
        assert_eq!(table.get(idx).unwrap().player_name(), "bob");

        table.get_mut(idx).unwrap().reset();
        assert!(table.get(idx).unwrap().occupied_since.is_none());
        assert_eq!(table.get(idx).unwrap().player_name(), "<unknown>");
    }

    #[test]
    fn test_ready_indices_ascending() {
        let mut table = SlotTable::new(4);
        for _ in 0..4 {
            let i = table.allocate(addr()).unwrap();
            table.connect(i, PlayerInfo::new("p", "f", -1), handle());
        }
        table.get_mut(3).unwrap().state = SlotState::Ready;
        table.get_mut(1).unwrap().state = SlotState::Ready;
        assert_eq!(table.ready_indices(), vec![1, 3]);
    }
}
