//! Response messages queued by streams for the socket writer.

use std::collections::VecDeque;

use tide_common::ids::{Opaque, Seqno, Vbid};
use tide_proto::codec::{
    BUFFER_ACK_EXT_LEN, DELETION_BASE_MSG_BYTES, HEADER_LEN, MARKER_EXT_LEN,
    MUTATION_BASE_MSG_BYTES, SEQNO_ACK_EXT_LEN, SET_VB_STATE_EXT_LEN, STREAM_END_EXT_LEN,
    STREAM_REQ_EXT_LEN,
};
use tide_proto::message::StreamEndReason;
use tide_storage::item::Item;
use tide_storage::vbucket::VbState;

/// Wire size of a system-event extras section (seqno, event id, version).
const SYSTEM_EVENT_EXT_LEN: usize = 13;

/// Kind of document message a [`MutationResponse`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationEvent {
    /// Document write.
    Mutation,
    /// Document delete.
    Deletion,
    /// Expiry-driven delete.
    Expiration,
    /// Durable write pending commit.
    Prepare,
}

/// One document message together with its transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationResponse {
    /// Stream correlation value.
    pub opaque: Opaque,
    /// The document, already transformed for transport.
    pub item: Item,
    /// Trailing meta section bytes.
    pub ext_meta: Vec<u8>,
    /// Message kind.
    pub event: MutationEvent,
}

impl MutationResponse {
    /// Exact wire size of this message.
    ///
    /// Deletions and expirations price at the deletion base; mutations and prepares at the
    /// mutation base.
    #[must_use]
    pub fn message_size(&self) -> usize {
        let base = match self.event {
            MutationEvent::Mutation | MutationEvent::Prepare => MUTATION_BASE_MSG_BYTES,
            MutationEvent::Deletion | MutationEvent::Expiration => DELETION_BASE_MSG_BYTES,
        };
        base + self.item.key.len() + self.item.value.len() + self.ext_meta.len()
    }
}

/// Seqno acknowledgement with both fields held in wire (network) byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoAckResponse {
    /// Acknowledged vBucket.
    pub vbid: Vbid,
    /// Stream correlation value.
    pub opaque: Opaque,
    in_memory_wire: u64,
    on_disk_wire: u64,
}

impl SeqnoAckResponse {
    /// Builds an ack from native-order seqnos.
    #[must_use]
    pub fn new(vbid: Vbid, opaque: Opaque, in_memory: Seqno, on_disk: Seqno) -> Self {
        Self {
            vbid,
            opaque,
            in_memory_wire: in_memory.to_be(),
            on_disk_wire: on_disk.to_be(),
        }
    }

    /// In-memory seqno in wire byte order.
    #[must_use]
    pub const fn in_memory_seqno(&self) -> u64 {
        self.in_memory_wire
    }

    /// On-disk seqno in wire byte order.
    #[must_use]
    pub const fn on_disk_seqno(&self) -> u64 {
        self.on_disk_wire
    }
}

/// One response awaiting the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcpResponse {
    /// Delimits one contiguous seqno range.
    SnapshotMarker {
        /// Target vBucket.
        vbid: Vbid,
        /// Stream correlation value.
        opaque: Opaque,
        /// First seqno of the range.
        start_seqno: Seqno,
        /// Last seqno of the range.
        end_seqno: Seqno,
        /// Marker flag bits.
        flags: u32,
    },
    /// Document message.
    Mutation(MutationResponse),
    /// Producer announces stream termination.
    StreamEnd {
        /// Target vBucket.
        vbid: Vbid,
        /// Stream correlation value.
        opaque: Opaque,
        /// Why the stream ended.
        reason: StreamEndReason,
    },
    /// Takeover state handoff.
    SetVbucketState {
        /// Target vBucket.
        vbid: Vbid,
        /// Stream correlation value.
        opaque: Opaque,
        /// Requested state.
        state: VbState,
    },
    /// Replica acknowledges prepared seqnos.
    SeqnoAck(SeqnoAckResponse),
    /// Consumer-side stream-request handshake message.
    StreamReq {
        /// Target vBucket.
        vbid: Vbid,
        /// Stream correlation value.
        opaque: Opaque,
        /// First seqno the consumer wants.
        start_seqno: Seqno,
    },
    /// Keepalive probe.
    Noop {
        /// Correlation value reserved for noop traffic.
        opaque: Opaque,
    },
    /// Flow-control acknowledgement of processed bytes.
    BufferAck {
        /// Bytes processed since the last ack.
        bytes: u32,
    },
    /// Connection-scoped control option.
    Control {
        /// Option name.
        key: String,
        /// Option value.
        value: String,
    },
    /// Version negotiation probe.
    GetErrorMap {
        /// Error-map version requested.
        version: u16,
    },
    /// Collection/scope lifecycle event.
    SystemEvent {
        /// Target vBucket.
        vbid: Vbid,
        /// Stream correlation value.
        opaque: Opaque,
        /// Sequence position of the event.
        by_seqno: Seqno,
        /// Event key bytes.
        key: Vec<u8>,
        /// Event payload bytes.
        data: Vec<u8>,
    },
}

impl DcpResponse {
    /// Exact wire size of this message, used for flow-control accounting.
    #[must_use]
    pub fn message_size(&self) -> usize {
        match self {
            Self::SnapshotMarker { .. } => HEADER_LEN + MARKER_EXT_LEN,
            Self::Mutation(response) => response.message_size(),
            Self::StreamEnd { .. } => HEADER_LEN + STREAM_END_EXT_LEN,
            Self::SetVbucketState { .. } => HEADER_LEN + SET_VB_STATE_EXT_LEN,
            Self::SeqnoAck(_) => HEADER_LEN + SEQNO_ACK_EXT_LEN,
            Self::StreamReq { .. } => HEADER_LEN + STREAM_REQ_EXT_LEN,
            Self::Noop { .. } => HEADER_LEN,
            Self::BufferAck { .. } => HEADER_LEN + BUFFER_ACK_EXT_LEN,
            Self::Control { key, value } => HEADER_LEN + key.len() + value.len(),
            Self::GetErrorMap { .. } => HEADER_LEN + 2,
            Self::SystemEvent { key, data, .. } => {
                HEADER_LEN + SYSTEM_EVENT_EXT_LEN + key.len() + data.len()
            }
        }
    }

    /// Sequence position of the message, for messages that carry one.
    #[must_use]
    pub fn by_seqno(&self) -> Option<Seqno> {
        match self {
            Self::Mutation(response) => Some(response.item.by_seqno),
            Self::SystemEvent { by_seqno, .. } => Some(*by_seqno),
            _ => None,
        }
    }
}

/// Ordered queue of responses awaiting the socket writer, with byte accounting.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    responses: VecDeque<DcpResponse>,
    bytes: usize,
}

impl ReadyQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one response.
    pub fn push(&mut self, response: DcpResponse) {
        self.bytes += response.message_size();
        self.responses.push_back(response);
    }

    /// Removes and returns the oldest response.
    pub fn pop(&mut self) -> Option<DcpResponse> {
        let response = self.responses.pop_front()?;
        self.bytes = self.bytes.saturating_sub(response.message_size());
        Some(response)
    }

    /// Peeks the oldest response.
    #[must_use]
    pub fn front(&self) -> Option<&DcpResponse> {
        self.responses.front()
    }

    /// Number of queued responses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Total wire bytes currently queued.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DcpResponse, MutationEvent, MutationResponse, ReadyQueue, SeqnoAckResponse,
    };
    use googletest::prelude::*;
    use rstest::rstest;
    use tide_proto::codec::{DELETION_BASE_MSG_BYTES, MUTATION_BASE_MSG_BYTES};
    use tide_storage::item::Item;

    fn mutation_response(event: MutationEvent, key: &[u8], value: &[u8]) -> MutationResponse {
        MutationResponse {
            opaque: 1,
            item: Item::mutation(0, key.to_vec(), value.to_vec()),
            ext_meta: vec![0x01],
            event,
        }
    }

    #[rstest]
    fn deletion_size_is_base_plus_key_plus_meta() {
        let response = mutation_response(MutationEvent::Deletion, b"key", b"");
        assert_that!(
            response.message_size(),
            eq(DELETION_BASE_MSG_BYTES + 3 + 1)
        );
    }

    #[rstest]
    fn mutation_size_is_base_plus_key_value_meta() {
        let response = mutation_response(MutationEvent::Mutation, b"key", br#"{"json":"yes"}"#);
        assert_that!(
            response.message_size(),
            eq(MUTATION_BASE_MSG_BYTES + 3 + 14 + 1)
        );
    }

    #[rstest]
    fn seqno_ack_stores_wire_order_fields() {
        let ack = SeqnoAckResponse::new(0, 1, 2, 0);
        assert_that!(ack.in_memory_seqno(), eq(2_u64.to_be()));
        assert_that!(ack.on_disk_seqno(), eq(0_u64));
    }

    #[rstest]
    fn ready_queue_tracks_bytes_in_fifo_order() {
        let mut queue = ReadyQueue::new();
        queue.push(DcpResponse::Noop { opaque: 9 });
        queue.push(DcpResponse::Mutation(mutation_response(
            MutationEvent::Mutation,
            b"k",
            b"v",
        )));
        assert_that!(queue.len(), eq(2_usize));
        assert_that!(queue.bytes() > 24, eq(true));

        let first = queue.pop().expect("first message");
        assert_that!(&first, eq(&DcpResponse::Noop { opaque: 9 }));
        let _ = queue.pop();
        assert_that!(queue.bytes(), eq(0_usize));
        assert_that!(queue.is_empty(), eq(true));
    }
}
