//! Per-vBucket state: hash table, sequence space, durability, and replica-side flags.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::debug;

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Cas, Seqno, VbUuid, Vbid};

use crate::checkpoint::CheckpointManager;
use crate::failover::FailoverTable;
use crate::item::{Item, ItemOp};
use crate::memory::MemoryTracker;

/// Replication role of one vBucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbState {
    /// Authoritative owner of the key range.
    Active,
    /// Passive copy fed by a DCP stream.
    Replica,
    /// Mid-takeover transitional state.
    Pending,
    /// Not serving traffic.
    Dead,
}

/// One resident document version.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoredDoc {
    value: Vec<u8>,
    cas: Cas,
    rev_seqno: Seqno,
    flags: u32,
    datatype: u8,
    deleted: bool,
}

/// Result of persisting one flush batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// Items moved to disk by this batch.
    pub num_flushed: usize,
    /// Highest prepare seqno persisted by this batch, when any prepare was in it.
    pub high_persisted_prepare: Option<Seqno>,
}

/// A shard of the key space with an independent sequence space.
#[derive(Debug)]
pub struct Vbucket {
    vbid: Vbid,
    state: VbState,
    uuid: VbUuid,
    /// Failover history, mutated only on state transitions.
    pub failover: FailoverTable,
    /// Checkpoint bookkeeping for in-memory streaming.
    pub checkpoints: CheckpointManager,
    table: HashMap<Vec<u8>, StoredDoc>,
    memory: Arc<MemoryTracker>,
    high_seqno: Seqno,
    persisted_seqno: Seqno,
    /// Prepares queued but not yet persisted, in seqno order.
    unpersisted_prepares: Vec<Seqno>,
    dirty: Vec<Item>,
    disk_log: Vec<Item>,
    receiving_disk_snapshot: Option<Seqno>,
    takeover_backed_up: bool,
}

impl Vbucket {
    /// Creates an empty vBucket in the given state.
    #[must_use]
    pub fn new(vbid: Vbid, state: VbState, uuid: VbUuid, memory: Arc<MemoryTracker>) -> Self {
        Self {
            vbid,
            state,
            uuid,
            failover: FailoverTable::new(uuid),
            checkpoints: CheckpointManager::new(vbid),
            table: HashMap::new(),
            memory,
            high_seqno: 0,
            persisted_seqno: 0,
            unpersisted_prepares: Vec::new(),
            dirty: Vec::new(),
            disk_log: Vec::new(),
            receiving_disk_snapshot: None,
            takeover_backed_up: false,
        }
    }

    /// Returns the vBucket id.
    #[must_use]
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Returns the current replication role.
    #[must_use]
    pub fn state(&self) -> VbState {
        self.state
    }

    /// Returns the current instance id.
    #[must_use]
    pub fn uuid(&self) -> VbUuid {
        self.uuid
    }

    /// Highest seqno assigned in this vBucket.
    #[must_use]
    pub fn high_seqno(&self) -> Seqno {
        self.high_seqno
    }

    /// Highest seqno persisted to disk.
    #[must_use]
    pub fn persisted_seqno(&self) -> Seqno {
        self.persisted_seqno
    }

    /// Transitions the replication role.
    ///
    /// Becoming active opens a new failover era at the current high seqno.
    pub fn set_state(&mut self, state: VbState, new_uuid: Option<VbUuid>) {
        if state == VbState::Active && self.state != VbState::Active {
            let uuid = new_uuid.unwrap_or(self.uuid.wrapping_add(1));
            self.uuid = uuid;
            self.failover.create_entry(uuid, self.high_seqno);
        }
        debug!(vbid = self.vbid, ?state, "vbucket state transition");
        self.state = state;
    }

    /// Marks the start of an initial disk snapshot ending at `snap_end`.
    pub fn set_receiving_disk_snapshot(&mut self, snap_end: Seqno) {
        self.receiving_disk_snapshot = Some(snap_end);
    }

    /// Returns whether an initial disk snapshot is still being received.
    #[must_use]
    pub fn is_receiving_disk_snapshot(&self) -> bool {
        self.receiving_disk_snapshot.is_some()
    }

    /// Clears the disk-snapshot phase (snapshot complete or superseded).
    pub fn clear_disk_snapshot(&mut self) {
        self.receiving_disk_snapshot = None;
    }

    /// Sets the takeover backed-up flag, refusing new replica ingest while up.
    pub fn set_takeover_backed_up(&mut self, backed_up: bool) {
        self.takeover_backed_up = backed_up;
    }

    /// Returns whether replica ingest is currently refused for takeover reasons.
    #[must_use]
    pub fn is_takeover_backed_up(&self) -> bool {
        self.takeover_backed_up
    }

    /// Stores an active-side write, assigning the next seqno.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::Failed` when invoked on a non-active vBucket.
    pub fn store(&mut self, mut item: Item) -> DcpResult<Seqno> {
        if self.state != VbState::Active {
            return Err(DcpError::Failed("store on non-active vbucket"));
        }
        item.by_seqno = self.high_seqno + 1;
        self.apply_sequenced(item)
    }

    /// Applies one replicated item at its wire-assigned seqno.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::TempFail` under memory pressure or while takeover ingest is refused;
    /// the caller decides whether to buffer or escalate per bucket policy.
    pub fn apply_replicated(&mut self, item: Item) -> DcpResult<Seqno> {
        if self.takeover_backed_up {
            return Err(DcpError::TempFail("takeover backed up"));
        }
        if self.memory.is_replication_throttled() {
            return Err(DcpError::TempFail("replication throttled"));
        }
        let seqno = self.apply_sequenced(item)?;
        if let Some(snap_end) = self.receiving_disk_snapshot {
            if seqno >= snap_end {
                self.receiving_disk_snapshot = None;
            }
        }
        Ok(seqno)
    }

    fn apply_sequenced(&mut self, item: Item) -> DcpResult<Seqno> {
        let seqno = item.by_seqno;
        let footprint = item.memory_footprint();

        match item.op {
            ItemOp::Deletion | ItemOp::Expiration => {
                if let Some(previous) = self.table.remove(&item.key) {
                    self.memory
                        .account_free(item.key.len() + previous.value.len());
                }
            }
            ItemOp::Mutation | ItemOp::Prepare | ItemOp::SystemEvent => {
                if let Some(previous) = self.table.get(&item.key) {
                    self.memory
                        .account_free(item.key.len() + previous.value.len());
                }
                self.table.insert(
                    item.key.clone(),
                    StoredDoc {
                        value: item.value.clone(),
                        cas: item.cas,
                        rev_seqno: item.rev_seqno,
                        flags: item.flags,
                        datatype: item.datatype,
                        deleted: false,
                    },
                );
                self.memory.account_alloc(footprint);
            }
        }

        if item.is_prepare() {
            self.unpersisted_prepares.push(seqno);
        }
        self.checkpoints.queue_item(item.clone())?;
        self.dirty.push(item);
        self.high_seqno = seqno;
        Ok(seqno)
    }

    /// Number of resident (non-deleted) documents.
    #[must_use]
    pub fn num_items(&self) -> usize {
        self.table.len()
    }

    /// Returns one resident value for test inspection.
    #[must_use]
    pub fn get_value(&self, key: &[u8]) -> Option<&[u8]> {
        self.table.get(key).map(|doc| doc.value.as_slice())
    }

    /// Persists the dirty batch, advancing the persisted seqno.
    pub fn flush(&mut self) -> FlushResult {
        let num_flushed = self.dirty.len();
        if num_flushed == 0 {
            return FlushResult {
                num_flushed: 0,
                high_persisted_prepare: None,
            };
        }

        let batch_end = self
            .dirty
            .last()
            .map_or(self.persisted_seqno, |item| item.by_seqno);
        self.disk_log.append(&mut self.dirty);
        self.persisted_seqno = batch_end;

        let mut high_prepare = None;
        self.unpersisted_prepares.retain(|prepare| {
            if *prepare <= batch_end {
                high_prepare = Some(high_prepare.map_or(*prepare, |high: Seqno| high.max(*prepare)));
                false
            } else {
                true
            }
        });

        FlushResult {
            num_flushed,
            high_persisted_prepare: high_prepare,
        }
    }

    /// Reads persisted items in seqno order for a `[start, end]` range.
    #[must_use]
    pub fn read_disk_range(&self, start: Seqno, end: Seqno) -> Vec<Item> {
        self.disk_log
            .iter()
            .filter(|item| item.by_seqno >= start && item.by_seqno <= end)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{VbState, Vbucket};
    use crate::item::{DurabilityRequirement, Item, ItemOp};
    use crate::memory::MemoryTracker;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn active_vbucket() -> Vbucket {
        Vbucket::new(
            0,
            VbState::Active,
            0xA0,
            Arc::new(MemoryTracker::new(1024 * 1024, 0.9)),
        )
    }

    #[rstest]
    fn store_assigns_consecutive_seqnos() {
        let mut vb = active_vbucket();
        let first = vb
            .store(Item::mutation(0, b"a".to_vec(), b"1".to_vec()))
            .expect("stores");
        let second = vb
            .store(Item::mutation(0, b"b".to_vec(), b"2".to_vec()))
            .expect("stores");

        assert_that!(first, eq(1_u64));
        assert_that!(second, eq(2_u64));
        assert_that!(vb.high_seqno(), eq(2_u64));
        assert_that!(vb.num_items(), eq(2_usize));
    }

    #[rstest]
    fn store_is_refused_off_the_active_state() {
        let mut vb = Vbucket::new(
            0,
            VbState::Replica,
            0xA0,
            Arc::new(MemoryTracker::new(1024, 0.9)),
        );
        let error = vb
            .store(Item::mutation(0, b"a".to_vec(), b"1".to_vec()))
            .expect_err("replica refuses active writes");
        assert_that!(format!("{error}").contains("non-active"), eq(true));
    }

    #[rstest]
    fn becoming_active_opens_a_new_failover_era() {
        let mut vb = Vbucket::new(
            0,
            VbState::Replica,
            0xA0,
            Arc::new(MemoryTracker::new(1024, 0.9)),
        );
        vb.set_state(VbState::Active, Some(0xB0));
        assert_that!(vb.uuid(), eq(0xB0_u64));
        assert_that!(vb.failover.entries().len(), eq(2_usize));
        assert_that!(vb.failover.latest_uuid(), eq(0xB0_u64));
    }

    #[rstest]
    fn replicated_ingest_throttles_under_memory_pressure() {
        let memory = Arc::new(MemoryTracker::new(100, 0.5));
        let mut vb = Vbucket::new(0, VbState::Replica, 0xA0, Arc::clone(&memory));
        memory.account_alloc(80);

        let mut item = Item::mutation(0, b"k".to_vec(), b"v".to_vec());
        item.by_seqno = 1;
        let error = vb.apply_replicated(item).expect_err("throttled");
        assert_that!(format!("{error}").contains("throttled"), eq(true));

        memory.set_max_data_size(1000);
        let mut retry = Item::mutation(0, b"k".to_vec(), b"v".to_vec());
        retry.by_seqno = 1;
        assert_that!(vb.apply_replicated(retry), eq(&Ok(1_u64)));
    }

    #[rstest]
    fn takeover_backed_up_refuses_ingest() {
        let mut vb = Vbucket::new(
            0,
            VbState::Replica,
            0xA0,
            Arc::new(MemoryTracker::new(1024 * 1024, 0.9)),
        );
        vb.set_takeover_backed_up(true);
        let mut item = Item::mutation(0, b"k".to_vec(), b"v".to_vec());
        item.by_seqno = 1;
        assert_that!(vb.apply_replicated(item).is_err(), eq(true));

        vb.set_takeover_backed_up(false);
        let mut retry = Item::mutation(0, b"k".to_vec(), b"v".to_vec());
        retry.by_seqno = 1;
        assert_that!(vb.apply_replicated(retry).is_ok(), eq(true));
    }

    #[rstest]
    fn disk_snapshot_phase_clears_at_the_snapshot_end() {
        let mut vb = Vbucket::new(
            0,
            VbState::Replica,
            0xA0,
            Arc::new(MemoryTracker::new(1024 * 1024, 0.9)),
        );
        vb.set_receiving_disk_snapshot(2);
        assert_that!(vb.is_receiving_disk_snapshot(), eq(true));

        let mut first = Item::mutation(0, b"a".to_vec(), b"1".to_vec());
        first.by_seqno = 1;
        vb.apply_replicated(first).expect("applies");
        assert_that!(vb.is_receiving_disk_snapshot(), eq(true));

        let mut last = Item::mutation(0, b"b".to_vec(), b"2".to_vec());
        last.by_seqno = 2;
        vb.apply_replicated(last).expect("applies");
        assert_that!(vb.is_receiving_disk_snapshot(), eq(false));
    }

    #[rstest]
    fn flush_reports_the_highest_persisted_prepare() {
        let mut vb = active_vbucket();
        vb.store(Item::mutation(0, b"a".to_vec(), b"1".to_vec()))
            .expect("stores");
        let mut prepare = Item::mutation(0, b"b".to_vec(), b"2".to_vec());
        prepare.op = ItemOp::Prepare;
        prepare.durability = Some(DurabilityRequirement::default());
        vb.store(prepare).expect("stores");
        vb.store(Item::mutation(0, b"c".to_vec(), b"3".to_vec()))
            .expect("stores");

        let result = vb.flush();
        assert_that!(result.num_flushed, eq(3_usize));
        assert_that!(result.high_persisted_prepare, eq(Some(2_u64)));
        assert_that!(vb.persisted_seqno(), eq(3_u64));

        // A second flush with no dirty items persists nothing further.
        let idle = vb.flush();
        assert_that!(idle.num_flushed, eq(0_usize));
        assert_that!(idle.high_persisted_prepare, eq(None));
    }

    #[rstest]
    fn disk_range_read_returns_items_in_seqno_order() {
        let mut vb = active_vbucket();
        for value in [b"1".to_vec(), b"2".to_vec(), b"3".to_vec()] {
            let key = value.clone();
            vb.store(Item::mutation(0, key, value)).expect("stores");
        }
        let _ = vb.flush();

        let range = vb.read_disk_range(2, 3);
        let seqnos = range.iter().map(|item| item.by_seqno).collect::<Vec<_>>();
        assert_that!(seqnos, eq(&vec![2_u64, 3]));
    }
}
