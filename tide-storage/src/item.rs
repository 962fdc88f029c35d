//! Document model flowing through checkpoints, backfills, and DCP streams.

use tide_common::ids::{Cas, Seqno, Vbid};

/// Datatype bit marking a raw (uninterpreted) value.
pub const DATATYPE_RAW: u8 = 0x00;
/// Datatype bit marking a JSON value.
pub const DATATYPE_JSON: u8 = 0x01;
/// Datatype bit marking a Snappy-compressed value.
pub const DATATYPE_SNAPPY: u8 = 0x02;
/// Datatype bit marking a value with a leading XATTR section.
pub const DATATYPE_XATTR: u8 = 0x04;

/// Durability level requested for a synchronous write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityLevel {
    /// Replicated to a majority of nodes in memory.
    #[default]
    Majority,
    /// Majority in memory, persisted on the active node.
    MajorityAndPersistOnMaster,
    /// Persisted on a majority of nodes.
    PersistToMajority,
}

/// Durability requirement attached to a prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurabilityRequirement {
    /// Requested level.
    pub level: DurabilityLevel,
    /// Optional timeout in milliseconds; `None` uses the bucket default.
    pub timeout_ms: Option<u64>,
}

/// Kind of operation one item records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOp {
    /// Regular document write.
    Mutation,
    /// Explicit delete (tombstone).
    Deletion,
    /// Expiry-driven delete.
    Expiration,
    /// Durable write pending commit.
    Prepare,
    /// Collection/scope lifecycle event.
    SystemEvent,
}

/// One ordered document version inside a vBucket sequence space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Owning vBucket.
    pub vbid: Vbid,
    /// Document key bytes.
    pub key: Vec<u8>,
    /// Value bytes; empty for value-less tombstones.
    pub value: Vec<u8>,
    /// Operation kind.
    pub op: ItemOp,
    /// Position in the vBucket sequence space.
    pub by_seqno: Seqno,
    /// Document revision counter.
    pub rev_seqno: Seqno,
    /// Compare-and-swap value.
    pub cas: Cas,
    /// Client-visible flags.
    pub flags: u32,
    /// Expiry time in unix seconds; zero means no expiry.
    pub exptime: u32,
    /// Datatype bitfield (`DATATYPE_*`).
    pub datatype: u8,
    /// Durability requirement when the item is a prepare.
    pub durability: Option<DurabilityRequirement>,
}

impl Item {
    /// Creates a plain mutation item.
    #[must_use]
    pub fn mutation(vbid: Vbid, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            vbid,
            key: key.into(),
            value: value.into(),
            op: ItemOp::Mutation,
            by_seqno: 0,
            rev_seqno: 1,
            cas: 0,
            flags: 0,
            exptime: 0,
            datatype: DATATYPE_RAW,
            durability: None,
        }
    }

    /// Creates a deletion (tombstone) item.
    #[must_use]
    pub fn deletion(vbid: Vbid, key: impl Into<Vec<u8>>) -> Self {
        Self {
            op: ItemOp::Deletion,
            ..Self::mutation(vbid, key, Vec::new())
        }
    }

    /// Returns whether this item is a durable write.
    #[must_use]
    pub const fn is_prepare(&self) -> bool {
        matches!(self.op, ItemOp::Prepare)
    }

    /// Bytes this item accounts against the bucket quota.
    #[must_use]
    pub fn memory_footprint(&self) -> usize {
        self.key.len() + self.value.len()
    }

    /// Returns whether the value carries the Snappy datatype bit.
    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.datatype & DATATYPE_SNAPPY != 0
    }

    /// Returns whether the value carries an XATTR section.
    #[must_use]
    pub const fn has_xattrs(&self) -> bool {
        self.datatype & DATATYPE_XATTR != 0
    }
}
