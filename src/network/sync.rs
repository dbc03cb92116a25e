//! Desync detection
//!
//! Every participant reports a checksum over its deterministic simulation
//! state once per tick. The server collects them here; a single pair of
//! differing values for the same tick is fatal, because diverged lockstep
//! simulations never reconverge.

use std::collections::BTreeMap;

/// A participant in the checksum exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Participant {
    /// The hosting simulation
    Host,
    /// A client, by slot index
    Slot(usize),
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Participant::Host => write!(f, "host"),
            Participant::Slot(i) => write!(f, "slot {i}"),
        }
    }
}

/// Result of recording one checksum report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Not every expected participant has reported yet
    Pending,
    /// Every expected participant reported the same value; entry evicted
    Match { tick: u32, checksum: u32 },
    /// Two participants disagree. Fatal; the session must end.
    Mismatch {
        tick: u32,
        reports: Vec<(Participant, u32)>,
    },
}

/// Unresolved ticks retained at most; older pending entries are evicted so a
/// participant that never reports cannot grow the table without bound
const MAX_PENDING_TICKS: usize = 64;

/// Per-tick checksum table
#[derive(Debug, Default)]
pub struct SyncTable {
    pending: BTreeMap<u32, BTreeMap<Participant, u32>>,
}

impl SyncTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one report. `expected` is the set of participants whose
    /// checksums close the tick - the live Ready slots plus the host.
    pub fn record(
        &mut self,
        tick: u32,
        who: Participant,
        checksum: u32,
        expected: &[Participant],
    ) -> SyncOutcome {
        let reports = self.pending.entry(tick).or_default();
        reports.insert(who, checksum);

        // Any disagreement is final, no need to wait for the rest
        let mut values = reports.values();
        if let Some(first) = values.next().copied() {
            if values.any(|&v| v != first) {
                let reports = self
                    .pending
                    .remove(&tick)
                    .map(|m| m.into_iter().collect())
                    .unwrap_or_default();
                return SyncOutcome::Mismatch { tick, reports };
            }
        }

        let all_reported = expected.iter().all(|p| reports.contains_key(p));
        if all_reported {
            self.pending.remove(&tick);
            self.evict_stale();
            return SyncOutcome::Match { tick, checksum };
        }

        self.evict_stale();
        SyncOutcome::Pending
    }

    /// Drop reports for a tick whose resolution was decided elsewhere
    /// (e.g. the reporting slot disconnected)
    pub fn discard(&mut self, tick: u32) {
        self.pending.remove(&tick);
    }

    pub fn pending_ticks(&self) -> usize {
        self.pending.len()
    }

    fn evict_stale(&mut self) {
        while self.pending.len() > MAX_PENDING_TICKS {
            if let Some((tick, _)) = self.pending.pop_first() {
                tracing::warn!("evicting unresolved checksum reports for tick {tick}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: Participant = Participant::Host;

    #[test]
    fn test_match_when_all_agree() {
        let mut table = SyncTable::new();
        let expected = [HOST, Participant::Slot(0), Participant::Slot(1)];

        assert_eq!(
            table.record(0, HOST, 0xABCD, &expected),
            SyncOutcome::Pending
        );
        assert_eq!(
            table.record(0, Participant::Slot(0), 0xABCD, &expected),
            SyncOutcome::Pending
        );
        assert_eq!(
            table.record(0, Participant::Slot(1), 0xABCD, &expected),
            SyncOutcome::Match {
                tick: 0,
                checksum: 0xABCD
            }
        );
        // Entry evicted on resolution
        assert_eq!(table.pending_ticks(), 0);
    }

    #[test]
    fn test_mismatch_is_immediate() {
        let mut table = SyncTable::new();
        let expected = [HOST, Participant::Slot(0), Participant::Slot(1)];

        table.record(7, HOST, 0xAAAA, &expected);
        // Slot 1 has not reported, but two differing values already decide it
        let outcome = table.record(7, Participant::Slot(0), 0xBBBB, &expected);

        match outcome {
            SyncOutcome::Mismatch { tick, reports } => {
                assert_eq!(tick, 7);
                assert_eq!(reports.len(), 2);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
        assert_eq!(table.pending_ticks(), 0);
    }

    #[test]
    fn test_independent_ticks() {
        let mut table = SyncTable::new();
        let expected = [HOST, Participant::Slot(0)];

        table.record(1, HOST, 1, &expected);
        table.record(2, HOST, 2, &expected);
        assert_eq!(table.pending_ticks(), 2);

        assert!(matches!(
            table.record(2, Participant::Slot(0), 2, &expected),
            SyncOutcome::Match { tick: 2, .. }
        ));
        assert_eq!(table.pending_ticks(), 1);
    }

    #[test]
    fn test_bounded_retention() {
        let mut table = SyncTable::new();
        let expected = [HOST, Participant::Slot(0)];

        for tick in 0..(MAX_PENDING_TICKS as u32 + 10) {
            table.record(tick, HOST, tick, &expected);
        }
        assert!(table.pending_ticks() <= MAX_PENDING_TICKS);
    }

    #[test]
    fn test_discard() {
        let mut table = SyncTable::new();
        let expected = [HOST, Participant::Slot(0)];
        table.record(3, HOST, 9, &expected);
        table.discard(3);
        assert_eq!(table.pending_ticks(), 0);
    }
}
