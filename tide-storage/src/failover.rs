//! Failover history and rollback resolution for one vBucket.

use tide_common::ids::{Seqno, VbUuid};

/// Default bound on retained failover entries.
pub const DEFAULT_MAX_ENTRIES: usize = 25;

/// One failover branch point: the vBucket instance id and the seqno at which it took over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    /// vBucket instance id for this era.
    pub vb_uuid: VbUuid,
    /// First seqno owned by this era.
    pub by_seqno: Seqno,
}

/// Outcome of resolving a client's claimed history against the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryResolution {
    /// The claimed history is consistent; streaming may begin as requested.
    Accept,
    /// The client must roll back to the given seqno and retry.
    Rollback(Seqno),
}

/// Ordered list of failover entries, newest first, with bounded capacity.
///
/// Mutated only on vBucket state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
    max_entries: usize,
}

impl FailoverTable {
    /// Creates a table seeded with one entry for a fresh vBucket.
    #[must_use]
    pub fn new(initial_uuid: VbUuid) -> Self {
        Self::with_capacity(initial_uuid, DEFAULT_MAX_ENTRIES)
    }

    /// Creates a table with a custom entry bound.
    ///
    /// A bound of zero is coerced to one entry.
    #[must_use]
    pub fn with_capacity(initial_uuid: VbUuid, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: vec![FailoverEntry {
                vb_uuid: initial_uuid,
                by_seqno: 0,
            }],
            max_entries,
        }
    }

    /// Records a new era starting at `high_seqno`, evicting the oldest entry past the bound.
    pub fn create_entry(&mut self, vb_uuid: VbUuid, high_seqno: Seqno) {
        self.entries.insert(
            0,
            FailoverEntry {
                vb_uuid,
                by_seqno: high_seqno,
            },
        );
        self.entries.truncate(self.max_entries);
    }

    /// Returns the current (newest) era id.
    #[must_use]
    pub fn latest_uuid(&self) -> VbUuid {
        self.entries[0].vb_uuid
    }

    /// Returns all entries, newest first.
    #[must_use]
    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Resolves a client's claimed `(vb_uuid, snapshot range)` against this table.
    ///
    /// A zero `start_seqno` always starts from scratch and never rolls back. An unknown era id
    /// rolls back to zero. A known era accepts the request while the claimed snapshot stays
    /// within the era; a snapshot straddling the branch point rolls back to the branch point (or
    /// the snapshot start, whichever is earlier).
    #[must_use]
    pub fn resolve(
        &self,
        start_seqno: Seqno,
        claimed_uuid: VbUuid,
        snap_start: Seqno,
        snap_end: Seqno,
    ) -> HistoryResolution {
        if start_seqno == 0 {
            return HistoryResolution::Accept;
        }

        let Some(position) = self
            .entries
            .iter()
            .position(|entry| entry.vb_uuid == claimed_uuid)
        else {
            return HistoryResolution::Rollback(0);
        };

        // The era owned by the claimed uuid ends where the next newer entry begins.
        let era_end = if position == 0 {
            Seqno::MAX
        } else {
            self.entries[position - 1].by_seqno
        };

        if start_seqno > era_end {
            return HistoryResolution::Rollback(era_end);
        }
        if snap_end > era_end && snap_start < era_end {
            return HistoryResolution::Rollback(snap_start.min(era_end));
        }
        HistoryResolution::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::{FailoverTable, HistoryResolution};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn fresh_table_has_one_zero_entry() {
        let table = FailoverTable::new(0xAB);
        assert_that!(table.entries().len(), eq(1_usize));
        assert_that!(table.latest_uuid(), eq(0xAB_u64));
        assert_that!(table.entries()[0].by_seqno, eq(0_u64));
    }

    #[rstest]
    fn create_entry_prepends_and_respects_bound() {
        let mut table = FailoverTable::with_capacity(1, 2);
        table.create_entry(2, 10);
        table.create_entry(3, 20);

        assert_that!(table.entries().len(), eq(2_usize));
        assert_that!(table.latest_uuid(), eq(3_u64));
        assert_that!(table.entries()[1].vb_uuid, eq(2_u64));
    }

    #[rstest]
    fn zero_start_seqno_always_accepts() {
        let table = FailoverTable::new(7);
        assert_that!(
            table.resolve(0, 999, 0, 0),
            eq(HistoryResolution::Accept)
        );
    }

    #[rstest]
    fn unknown_uuid_rolls_back_to_zero() {
        let table = FailoverTable::new(7);
        assert_that!(
            table.resolve(5, 999, 5, 5),
            eq(HistoryResolution::Rollback(0))
        );
    }

    #[rstest]
    fn start_past_branch_point_rolls_back_to_branch_point() {
        let mut table = FailoverTable::new(1);
        table.create_entry(2, 10);

        // Client claims era 1 but has applied seqnos past the takeover at 10.
        assert_that!(
            table.resolve(15, 1, 15, 15),
            eq(HistoryResolution::Rollback(10))
        );
    }

    #[rstest]
    fn snapshot_straddling_branch_point_rolls_back_to_snapshot_start() {
        let mut table = FailoverTable::new(1);
        table.create_entry(2, 10);

        assert_that!(
            table.resolve(9, 1, 8, 12),
            eq(HistoryResolution::Rollback(8))
        );
    }

    #[rstest]
    fn consistent_history_in_current_era_accepts() {
        let mut table = FailoverTable::new(1);
        table.create_entry(2, 10);

        assert_that!(
            table.resolve(12, 2, 12, 12),
            eq(HistoryResolution::Accept)
        );
        assert_that!(table.resolve(8, 1, 6, 9), eq(HistoryResolution::Accept));
    }
}
