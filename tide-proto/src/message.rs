//! Opcodes, flag bitfields, and status codes for DCP messages.

/// Wire opcodes for DCP messages carried atop the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Open a DCP connection.
    Open = 0x50,
    /// Consumer asks its vBucket to be streamed.
    AddStream = 0x51,
    /// Close one stream.
    CloseStream = 0x52,
    /// Producer-side stream request.
    StreamReq = 0x53,
    /// Producer announces the end of one stream.
    StreamEnd = 0x55,
    /// Delimits one contiguous seqno range.
    SnapshotMarker = 0x56,
    /// Document write.
    Mutation = 0x57,
    /// Document delete.
    Deletion = 0x58,
    /// Document expiry.
    Expiration = 0x59,
    /// Flush marker (legacy).
    Flush = 0x5a,
    /// vBucket state transition during takeover.
    SetVbucketState = 0x5b,
    /// Keepalive probe.
    Noop = 0x5c,
    /// Flow-control buffer acknowledgement.
    BufferAck = 0x5d,
    /// Connection-scoped control option.
    Control = 0x5e,
    /// Collection/scope lifecycle event.
    SystemEvent = 0x5f,
    /// Durable write pending commit.
    Prepare = 0x60,
    /// Replica acknowledges prepared seqnos.
    SeqnoAcknowledged = 0x61,
    /// Commit of a durable write.
    Commit = 0x62,
    /// Abort of a durable write.
    Abort = 0x63,
    /// Version negotiation probe.
    GetErrorMap = 0xfe,
    /// Deletion carrying a delete-time field.
    DeletionV2 = 0x64,
}

impl Opcode {
    /// Parses a wire opcode byte.
    #[must_use]
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0x50 => Some(Self::Open),
            0x51 => Some(Self::AddStream),
            0x52 => Some(Self::CloseStream),
            0x53 => Some(Self::StreamReq),
            0x55 => Some(Self::StreamEnd),
            0x56 => Some(Self::SnapshotMarker),
            0x57 => Some(Self::Mutation),
            0x58 => Some(Self::Deletion),
            0x59 => Some(Self::Expiration),
            0x5a => Some(Self::Flush),
            0x5b => Some(Self::SetVbucketState),
            0x5c => Some(Self::Noop),
            0x5d => Some(Self::BufferAck),
            0x5e => Some(Self::Control),
            0x5f => Some(Self::SystemEvent),
            0x60 => Some(Self::Prepare),
            0x61 => Some(Self::SeqnoAcknowledged),
            0x62 => Some(Self::Commit),
            0x63 => Some(Self::Abort),
            0x64 => Some(Self::DeletionV2),
            0xfe => Some(Self::GetErrorMap),
            _ => None,
        }
    }
}

/// Bitfield of connection-open flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// The connection is a producer.
    pub const PRODUCER: u32 = 0x01;
    /// The connection is a notifier.
    pub const NOTIFIER: u32 = 0x02;
    /// Stream document XATTR sections.
    pub const INCLUDE_XATTRS: u32 = 0x04;
    /// Strip values entirely.
    pub const NO_VALUE: u32 = 0x08;
    /// Strip values but preserve the underlying datatype.
    pub const NO_VALUE_WITH_UNDERLYING_DATATYPE: u32 = 0x40;

    /// Returns whether all bits in `mask` are set.
    #[must_use]
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }
}

/// Reason carried by a stream-end message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamEndReason {
    /// The stream finished its requested range.
    Ok = 0,
    /// The client asked for the stream to close.
    Closed = 1,
    /// The vBucket state changed.
    StateChanged = 2,
    /// The connection is going away.
    Disconnected = 3,
    /// The consumer could not keep up.
    Slow = 4,
}

impl StreamEndReason {
    /// Parses the wire value.
    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::Closed),
            2 => Some(Self::StateChanged),
            3 => Some(Self::Disconnected),
            4 => Some(Self::Slow),
            _ => None,
        }
    }
}

/// Bitfield of snapshot-marker flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MarkerFlags(pub u32);

impl MarkerFlags {
    /// Snapshot produced from in-memory checkpoints.
    pub const MEMORY: u32 = 0x1;
    /// Snapshot produced from a disk backfill.
    pub const DISK: u32 = 0x2;
    /// Snapshot coincides with a checkpoint boundary.
    pub const CHECKPOINT: u32 = 0x4;
    /// Producer requests an acknowledgement for this snapshot.
    pub const ACK: u32 = 0x8;

    /// Returns whether all bits in `mask` are set.
    #[must_use]
    pub const fn contains(self, mask: u32) -> bool {
        self.0 & mask == mask
    }
}

/// Response status codes the DCP layer interprets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Status {
    /// Request succeeded.
    Success = 0x0000,
    /// Key not found.
    KeyNotFound = 0x0001,
    /// Invalid arguments.
    InvalidArguments = 0x0004,
    /// Rollback required; body carries the rollback seqno.
    Rollback = 0x0023,
    /// Opcode unknown to the peer.
    UnknownCommand = 0x0081,
    /// Not supported by the peer.
    NotSupported = 0x0083,
    /// Transient failure; retry later.
    TempFail = 0x0086,
}

impl Status {
    /// Parses the wire value.
    #[must_use]
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::KeyNotFound),
            0x0004 => Some(Self::InvalidArguments),
            0x0023 => Some(Self::Rollback),
            0x0081 => Some(Self::UnknownCommand),
            0x0083 => Some(Self::NotSupported),
            0x0086 => Some(Self::TempFail),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MarkerFlags, Opcode, OpenFlags, Status, StreamEndReason};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x50, Some(Opcode::Open))]
    #[case(0x57, Some(Opcode::Mutation))]
    #[case(0x61, Some(Opcode::SeqnoAcknowledged))]
    #[case(0xfe, Some(Opcode::GetErrorMap))]
    #[case(0x42, None)]
    fn opcode_roundtrips_wire_bytes(#[case] raw: u8, #[case] expected: Option<Opcode>) {
        assert_that!(Opcode::from_u8(raw), eq(expected));
    }

    #[rstest]
    fn open_flags_compose_as_a_bitfield() {
        let flags = OpenFlags(OpenFlags::PRODUCER | OpenFlags::INCLUDE_XATTRS);
        assert_that!(flags.contains(OpenFlags::PRODUCER), eq(true));
        assert_that!(flags.contains(OpenFlags::INCLUDE_XATTRS), eq(true));
        assert_that!(flags.contains(OpenFlags::NO_VALUE), eq(false));
    }

    #[rstest]
    fn stream_end_reason_covers_the_wire_range() {
        assert_that!(StreamEndReason::from_u32(1), eq(Some(StreamEndReason::Closed)));
        assert_that!(StreamEndReason::from_u32(4), eq(Some(StreamEndReason::Slow)));
        assert_that!(StreamEndReason::from_u32(9), eq(None));
    }

    #[rstest]
    fn marker_flags_distinguish_disk_and_memory() {
        let disk = MarkerFlags(MarkerFlags::DISK);
        assert_that!(disk.contains(MarkerFlags::DISK), eq(true));
        assert_that!(disk.contains(MarkerFlags::MEMORY), eq(false));
    }

    #[rstest]
    fn status_parses_negotiation_outcomes() {
        assert_that!(Status::from_u16(0), eq(Some(Status::Success)));
        assert_that!(Status::from_u16(0x81), eq(Some(Status::UnknownCommand)));
        assert_that!(Status::from_u16(0xffff), eq(None));
    }
}
