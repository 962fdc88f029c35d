//! Big-endian frame codec for DCP messages.
//!
//! Frames ride the 24-byte binary protocol header; all multi-byte fields are network order.

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Cas, Opaque, Seqno, VbUuid, Vbid};

use crate::message::Opcode;

/// Binary protocol header length.
pub const HEADER_LEN: usize = 24;
/// Extras length of a mutation message.
pub const MUTATION_EXT_LEN: usize = 31;
/// Extras length of a deletion message.
pub const DELETION_EXT_LEN: usize = 18;
/// Extras length of an expiration message.
pub const EXPIRATION_EXT_LEN: usize = 20;
/// Extras length of a snapshot marker.
pub const MARKER_EXT_LEN: usize = 20;
/// Extras length of a stream-end message.
pub const STREAM_END_EXT_LEN: usize = 4;
/// Extras length of a seqno acknowledgement (two 64-bit seqnos).
pub const SEQNO_ACK_EXT_LEN: usize = 16;
/// Extras length of a stream request.
pub const STREAM_REQ_EXT_LEN: usize = 48;
/// Extras length of a buffer acknowledgement.
pub const BUFFER_ACK_EXT_LEN: usize = 4;
/// Extras length of a set-vbucket-state message.
pub const SET_VB_STATE_EXT_LEN: usize = 1;

/// Base wire size of a mutation response: header plus mutation extras.
pub const MUTATION_BASE_MSG_BYTES: usize = HEADER_LEN + MUTATION_EXT_LEN;
/// Base wire size of a deletion response: header plus deletion extras.
pub const DELETION_BASE_MSG_BYTES: usize = HEADER_LEN + DELETION_EXT_LEN;

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

/// One decoded (or to-be-encoded) DCP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DcpFrame {
    /// Message opcode.
    pub opcode: Opcode,
    /// Whether this frame is a response.
    pub response: bool,
    /// Datatype bitfield of the value.
    pub datatype: u8,
    /// vBucket id on requests; status code on responses.
    pub vbucket_or_status: u16,
    /// Stream correlation value.
    pub opaque: Opaque,
    /// Document CAS where applicable.
    pub cas: Cas,
    /// Fixed-layout extras.
    pub extras: Vec<u8>,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

impl DcpFrame {
    /// Creates a request frame skeleton.
    #[must_use]
    pub fn request(opcode: Opcode, vbucket: Vbid, opaque: Opaque) -> Self {
        Self {
            opcode,
            response: false,
            datatype: 0,
            vbucket_or_status: vbucket,
            opaque,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Creates a response frame skeleton.
    #[must_use]
    pub fn response(opcode: Opcode, status: u16, opaque: Opaque) -> Self {
        Self {
            opcode,
            response: true,
            datatype: 0,
            vbucket_or_status: status,
            opaque,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Total encoded size of this frame.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Encodes the frame into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::TooBig` when a variable-length section exceeds its header field.
    pub fn encode(&self) -> DcpResult<Vec<u8>> {
        let key_len = u16::try_from(self.key.len()).map_err(|_| DcpError::TooBig)?;
        let ext_len = u8::try_from(self.extras.len()).map_err(|_| DcpError::TooBig)?;
        let body_len = u32::try_from(self.extras.len() + self.key.len() + self.value.len())
            .map_err(|_| DcpError::TooBig)?;

        let mut output = Vec::with_capacity(self.wire_len());
        output.push(if self.response {
            MAGIC_RESPONSE
        } else {
            MAGIC_REQUEST
        });
        output.push(self.opcode as u8);
        output.extend_from_slice(&key_len.to_be_bytes());
        output.push(ext_len);
        output.push(self.datatype);
        output.extend_from_slice(&self.vbucket_or_status.to_be_bytes());
        output.extend_from_slice(&body_len.to_be_bytes());
        output.extend_from_slice(&self.opaque.to_be_bytes());
        output.extend_from_slice(&self.cas.to_be_bytes());
        output.extend_from_slice(&self.extras);
        output.extend_from_slice(&self.key);
        output.extend_from_slice(&self.value);
        Ok(output)
    }

    /// Decodes one frame from wire bytes, consuming the whole payload.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::Protocol` when the payload is truncated, carries an unknown
    /// opcode/magic, or its length fields disagree with the body.
    pub fn decode(payload: &[u8]) -> DcpResult<Self> {
        let mut cursor = FrameCursor::new(payload);

        let magic = cursor.read_u8()?;
        let response = match magic {
            MAGIC_REQUEST => false,
            MAGIC_RESPONSE => true,
            other => {
                return Err(frame_error(format!("invalid magic byte {other:#04x}")));
            }
        };

        let opcode_raw = cursor.read_u8()?;
        let Some(opcode) = Opcode::from_u8(opcode_raw) else {
            return Err(frame_error(format!("unknown opcode {opcode_raw:#04x}")));
        };

        let key_len = usize::from(cursor.read_u16()?);
        let ext_len = usize::from(cursor.read_u8()?);
        let datatype = cursor.read_u8()?;
        let vbucket_or_status = cursor.read_u16()?;
        let body_len = usize::try_from(cursor.read_u32()?)
            .map_err(|_| frame_error("body length exceeds platform limits"))?;
        let opaque = cursor.read_u32()?;
        let cas = cursor.read_u64()?;

        if body_len < ext_len + key_len {
            return Err(frame_error(format!(
                "body length {body_len} shorter than extras {ext_len} plus key {key_len}"
            )));
        }
        let value_len = body_len - ext_len - key_len;

        let extras = cursor.read_vec(ext_len)?;
        let key = cursor.read_vec(key_len)?;
        let value = cursor.read_vec(value_len)?;
        cursor.ensure_fully_consumed()?;

        Ok(Self {
            opcode,
            response,
            datatype,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        })
    }
}

/// Snapshot-marker extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerBody {
    /// First seqno of the snapshot.
    pub start_seqno: Seqno,
    /// Last seqno of the snapshot.
    pub end_seqno: Seqno,
    /// Marker flag bits.
    pub flags: u32,
}

/// Encodes a snapshot marker frame.
#[must_use]
pub fn marker_frame(vbucket: Vbid, opaque: Opaque, body: MarkerBody) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::SnapshotMarker, vbucket, opaque);
    let mut extras = Vec::with_capacity(MARKER_EXT_LEN);
    extras.extend_from_slice(&body.start_seqno.to_be_bytes());
    extras.extend_from_slice(&body.end_seqno.to_be_bytes());
    extras.extend_from_slice(&body.flags.to_be_bytes());
    frame.extras = extras;
    frame
}

/// Decodes snapshot-marker extras.
pub fn parse_marker(frame: &DcpFrame) -> DcpResult<MarkerBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let body = MarkerBody {
        start_seqno: cursor.read_u64()?,
        end_seqno: cursor.read_u64()?,
        flags: cursor.read_u32()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

/// Mutation extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutationBody {
    /// Sequence position of the write.
    pub by_seqno: Seqno,
    /// Document revision counter.
    pub rev_seqno: Seqno,
    /// Client-visible flags.
    pub flags: u32,
    /// Expiry time in unix seconds.
    pub exptime: u32,
    /// Lock expiry in seconds.
    pub lock_time: u32,
    /// Length of the trailing meta section.
    pub nmeta: u16,
    /// Access-frequency hint.
    pub nru: u8,
}

/// Encodes a mutation frame.
#[must_use]
pub fn mutation_frame(
    vbucket: Vbid,
    opaque: Opaque,
    body: MutationBody,
    key: Vec<u8>,
    value: Vec<u8>,
    datatype: u8,
    cas: Cas,
) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::Mutation, vbucket, opaque);
    let mut extras = Vec::with_capacity(MUTATION_EXT_LEN);
    extras.extend_from_slice(&body.by_seqno.to_be_bytes());
    extras.extend_from_slice(&body.rev_seqno.to_be_bytes());
    extras.extend_from_slice(&body.flags.to_be_bytes());
    extras.extend_from_slice(&body.exptime.to_be_bytes());
    extras.extend_from_slice(&body.lock_time.to_be_bytes());
    extras.extend_from_slice(&body.nmeta.to_be_bytes());
    extras.push(body.nru);
    frame.extras = extras;
    frame.key = key;
    frame.value = value;
    frame.datatype = datatype;
    frame.cas = cas;
    frame
}

/// Decodes mutation extras.
pub fn parse_mutation(frame: &DcpFrame) -> DcpResult<MutationBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let body = MutationBody {
        by_seqno: cursor.read_u64()?,
        rev_seqno: cursor.read_u64()?,
        flags: cursor.read_u32()?,
        exptime: cursor.read_u32()?,
        lock_time: cursor.read_u32()?,
        nmeta: cursor.read_u16()?,
        nru: cursor.read_u8()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

/// Deletion extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeletionBody {
    /// Sequence position of the delete.
    pub by_seqno: Seqno,
    /// Document revision counter.
    pub rev_seqno: Seqno,
    /// Length of the trailing meta section.
    pub nmeta: u16,
}

/// Encodes a deletion frame.
#[must_use]
pub fn deletion_frame(
    vbucket: Vbid,
    opaque: Opaque,
    body: DeletionBody,
    key: Vec<u8>,
    value: Vec<u8>,
) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::Deletion, vbucket, opaque);
    let mut extras = Vec::with_capacity(DELETION_EXT_LEN);
    extras.extend_from_slice(&body.by_seqno.to_be_bytes());
    extras.extend_from_slice(&body.rev_seqno.to_be_bytes());
    extras.extend_from_slice(&body.nmeta.to_be_bytes());
    frame.extras = extras;
    frame.key = key;
    frame.value = value;
    frame
}

/// Decodes deletion extras.
pub fn parse_deletion(frame: &DcpFrame) -> DcpResult<DeletionBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let body = DeletionBody {
        by_seqno: cursor.read_u64()?,
        rev_seqno: cursor.read_u64()?,
        nmeta: cursor.read_u16()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

/// Encodes a stream-end frame.
#[must_use]
pub fn stream_end_frame(vbucket: Vbid, opaque: Opaque, reason: u32) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::StreamEnd, vbucket, opaque);
    frame.extras = reason.to_be_bytes().to_vec();
    frame
}

/// Decodes stream-end extras.
pub fn parse_stream_end(frame: &DcpFrame) -> DcpResult<u32> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let reason = cursor.read_u32()?;
    cursor.ensure_fully_consumed()?;
    Ok(reason)
}

/// Encodes a seqno-acknowledgement frame carrying two network-order seqnos.
#[must_use]
pub fn seqno_ack_frame(
    vbucket: Vbid,
    opaque: Opaque,
    in_memory_seqno: Seqno,
    on_disk_seqno: Seqno,
) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::SeqnoAcknowledged, vbucket, opaque);
    let mut extras = Vec::with_capacity(SEQNO_ACK_EXT_LEN);
    extras.extend_from_slice(&in_memory_seqno.to_be_bytes());
    extras.extend_from_slice(&on_disk_seqno.to_be_bytes());
    frame.extras = extras;
    frame
}

/// Decodes seqno-acknowledgement extras as `(in_memory, on_disk)`.
pub fn parse_seqno_ack(frame: &DcpFrame) -> DcpResult<(Seqno, Seqno)> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let in_memory = cursor.read_u64()?;
    let on_disk = cursor.read_u64()?;
    cursor.ensure_fully_consumed()?;
    Ok((in_memory, on_disk))
}

/// Stream-request extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamReqBody {
    /// Stream flags.
    pub flags: u32,
    /// First seqno the client wants.
    pub start_seqno: Seqno,
    /// Last seqno the client wants.
    pub end_seqno: Seqno,
    /// Claimed vBucket instance id.
    pub vb_uuid: VbUuid,
    /// Claimed snapshot start.
    pub snap_start_seqno: Seqno,
    /// Claimed snapshot end.
    pub snap_end_seqno: Seqno,
}

/// Encodes a stream-request frame.
#[must_use]
pub fn stream_req_frame(vbucket: Vbid, opaque: Opaque, body: StreamReqBody) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::StreamReq, vbucket, opaque);
    let mut extras = Vec::with_capacity(STREAM_REQ_EXT_LEN);
    extras.extend_from_slice(&body.flags.to_be_bytes());
    extras.extend_from_slice(&0_u32.to_be_bytes());
    extras.extend_from_slice(&body.start_seqno.to_be_bytes());
    extras.extend_from_slice(&body.end_seqno.to_be_bytes());
    extras.extend_from_slice(&body.vb_uuid.to_be_bytes());
    extras.extend_from_slice(&body.snap_start_seqno.to_be_bytes());
    extras.extend_from_slice(&body.snap_end_seqno.to_be_bytes());
    frame.extras = extras;
    frame
}

/// Decodes stream-request extras.
pub fn parse_stream_req(frame: &DcpFrame) -> DcpResult<StreamReqBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let flags = cursor.read_u32()?;
    let _reserved = cursor.read_u32()?;
    let body = StreamReqBody {
        flags,
        start_seqno: cursor.read_u64()?,
        end_seqno: cursor.read_u64()?,
        vb_uuid: cursor.read_u64()?,
        snap_start_seqno: cursor.read_u64()?,
        snap_end_seqno: cursor.read_u64()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

/// Encodes a buffer-acknowledgement frame.
#[must_use]
pub fn buffer_ack_frame(vbucket: Vbid, opaque: Opaque, buffer_bytes: u32) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::BufferAck, vbucket, opaque);
    frame.extras = buffer_bytes.to_be_bytes().to_vec();
    frame
}

/// Decodes buffer-acknowledgement extras.
pub fn parse_buffer_ack(frame: &DcpFrame) -> DcpResult<u32> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let bytes = cursor.read_u32()?;
    cursor.ensure_fully_consumed()?;
    Ok(bytes)
}

/// Encodes a control frame (`key` is the option name, `value` its setting).
#[must_use]
pub fn control_frame(opaque: Opaque, key: &str, value: &str) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::Control, 0, opaque);
    frame.key = key.as_bytes().to_vec();
    frame.value = value.as_bytes().to_vec();
    frame
}

/// Expiration extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpirationBody {
    /// Sequence position of the expiry.
    pub by_seqno: Seqno,
    /// Document revision counter.
    pub rev_seqno: Seqno,
    /// Tombstone creation time in unix seconds.
    pub delete_time: u32,
}

/// Encodes an expiration frame.
#[must_use]
pub fn expiration_frame(
    vbucket: Vbid,
    opaque: Opaque,
    body: ExpirationBody,
    key: Vec<u8>,
) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::Expiration, vbucket, opaque);
    let mut extras = Vec::with_capacity(EXPIRATION_EXT_LEN);
    extras.extend_from_slice(&body.by_seqno.to_be_bytes());
    extras.extend_from_slice(&body.rev_seqno.to_be_bytes());
    extras.extend_from_slice(&body.delete_time.to_be_bytes());
    frame.extras = extras;
    frame.key = key;
    frame
}

/// Decodes expiration extras.
pub fn parse_expiration(frame: &DcpFrame) -> DcpResult<ExpirationBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let body = ExpirationBody {
        by_seqno: cursor.read_u64()?,
        rev_seqno: cursor.read_u64()?,
        delete_time: cursor.read_u32()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

/// Encodes a set-vbucket-state frame; `state` is the wire encoding of the target state.
#[must_use]
pub fn set_vbucket_state_frame(vbucket: Vbid, opaque: Opaque, state: u8) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::SetVbucketState, vbucket, opaque);
    frame.extras = vec![state];
    frame
}

/// Decodes set-vbucket-state extras.
pub fn parse_set_vbucket_state(frame: &DcpFrame) -> DcpResult<u8> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let state = cursor.read_u8()?;
    cursor.ensure_fully_consumed()?;
    Ok(state)
}

/// Encodes a noop frame.
#[must_use]
pub fn noop_frame(opaque: Opaque) -> DcpFrame {
    DcpFrame::request(Opcode::Noop, 0, opaque)
}

/// Encodes a get-error-map frame; the value carries the requested map version.
#[must_use]
pub fn get_error_map_frame(opaque: Opaque, version: u16) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::GetErrorMap, 0, opaque);
    frame.value = version.to_be_bytes().to_vec();
    frame
}

/// System-event extras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemEventBody {
    /// Sequence position of the event.
    pub by_seqno: Seqno,
    /// Event id.
    pub event: u32,
    /// Version of the event payload format.
    pub version: u8,
}

/// Encodes a system-event frame.
#[must_use]
pub fn system_event_frame(
    vbucket: Vbid,
    opaque: Opaque,
    body: SystemEventBody,
    key: Vec<u8>,
    data: Vec<u8>,
) -> DcpFrame {
    let mut frame = DcpFrame::request(Opcode::SystemEvent, vbucket, opaque);
    let mut extras = Vec::with_capacity(13);
    extras.extend_from_slice(&body.by_seqno.to_be_bytes());
    extras.extend_from_slice(&body.event.to_be_bytes());
    extras.push(body.version);
    frame.extras = extras;
    frame.key = key;
    frame.value = data;
    frame
}

/// Decodes system-event extras.
pub fn parse_system_event(frame: &DcpFrame) -> DcpResult<SystemEventBody> {
    let mut cursor = FrameCursor::new(&frame.extras);
    let body = SystemEventBody {
        by_seqno: cursor.read_u64()?,
        event: cursor.read_u32()?,
        version: cursor.read_u8()?,
    };
    cursor.ensure_fully_consumed()?;
    Ok(body)
}

fn frame_error(message: impl Into<String>) -> DcpError {
    DcpError::Protocol(format!("frame error: {}", message.into()))
}

/// Stateful byte reader that tracks decoding position for robust error messages.
#[derive(Debug)]
struct FrameCursor<'a> {
    payload: &'a [u8],
    offset: usize,
}

impl<'a> FrameCursor<'a> {
    fn new(payload: &'a [u8]) -> Self {
        Self { payload, offset: 0 }
    }

    fn read_u8(&mut self) -> DcpResult<u8> {
        let bytes = self.read_slice(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> DcpResult<u16> {
        let bytes = self.read_slice(2)?;
        let mut array = [0_u8; 2];
        array.copy_from_slice(bytes);
        Ok(u16::from_be_bytes(array))
    }

    fn read_u32(&mut self) -> DcpResult<u32> {
        let bytes = self.read_slice(4)?;
        let mut array = [0_u8; 4];
        array.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(array))
    }

    fn read_u64(&mut self) -> DcpResult<u64> {
        let bytes = self.read_slice(8)?;
        let mut array = [0_u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    fn read_vec(&mut self, len: usize) -> DcpResult<Vec<u8>> {
        Ok(self.read_slice(len)?.to_vec())
    }

    fn read_slice(&mut self, len: usize) -> DcpResult<&'a [u8]> {
        let end = self
            .offset
            .checked_add(len)
            .ok_or_else(|| frame_error("offset overflow while decoding"))?;
        if end > self.payload.len() {
            return Err(frame_error(format!(
                "unexpected end of payload at byte offset {} while reading {len} bytes",
                self.offset
            )));
        }
        let bytes = &self.payload[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn ensure_fully_consumed(&self) -> DcpResult<()> {
        if self.offset == self.payload.len() {
            return Ok(());
        }
        Err(frame_error(format!(
            "trailing bytes after body: consumed {}, total {}",
            self.offset,
            self.payload.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DELETION_BASE_MSG_BYTES, DcpFrame, MUTATION_BASE_MSG_BYTES, MarkerBody, MutationBody,
        StreamReqBody, marker_frame, mutation_frame, parse_marker, parse_mutation,
        parse_seqno_ack, parse_stream_end, parse_stream_req, seqno_ack_frame, stream_end_frame,
        stream_req_frame,
    };
    use googletest::prelude::*;
    use rstest::rstest;
    use tide_common::error::DcpError;

    #[rstest]
    fn base_message_sizes_match_the_wire_contract() {
        assert_that!(MUTATION_BASE_MSG_BYTES, eq(55_usize));
        assert_that!(DELETION_BASE_MSG_BYTES, eq(42_usize));
    }

    #[rstest]
    fn marker_frame_roundtrips() {
        let frame = marker_frame(
            7,
            42,
            MarkerBody {
                start_seqno: 1,
                end_seqno: 100,
                flags: 0x1,
            },
        );
        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(&decoded, eq(&frame));
        let body = parse_marker(&decoded).expect("parses");
        assert_that!(body.start_seqno, eq(1_u64));
        assert_that!(body.end_seqno, eq(100_u64));
    }

    #[rstest]
    fn mutation_frame_size_accounts_for_every_section() {
        let frame = mutation_frame(
            0,
            1,
            MutationBody {
                by_seqno: 3,
                rev_seqno: 1,
                nmeta: 1,
                ..MutationBody::default()
            },
            b"key".to_vec(),
            b"value".to_vec(),
            0,
            0,
        );
        assert_that!(frame.wire_len(), eq(MUTATION_BASE_MSG_BYTES + 3 + 5));

        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        let body = parse_mutation(&decoded).expect("parses");
        assert_that!(body.by_seqno, eq(3_u64));
        assert_that!(decoded.key.as_slice(), eq(b"key".as_slice()));
    }

    #[rstest]
    fn seqno_ack_carries_two_network_order_seqnos() {
        let frame = seqno_ack_frame(0, 9, 2, 0);
        // Extras bytes are plain big-endian: seqno 2 encodes with the low byte last.
        assert_that!(frame.extras[7], eq(2_u8));
        assert_that!(frame.extras[15], eq(0_u8));

        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_seqno_ack(&decoded), eq(&Ok((2_u64, 0_u64))));
    }

    #[rstest]
    fn stream_request_roundtrips_all_claimed_history_fields() {
        let body = StreamReqBody {
            flags: 0,
            start_seqno: 10,
            end_seqno: u64::MAX,
            vb_uuid: 0xA0,
            snap_start_seqno: 8,
            snap_end_seqno: 12,
        };
        let frame = stream_req_frame(3, 77, body);
        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_stream_req(&decoded), eq(&Ok(body)));
    }

    #[rstest]
    fn stream_end_reason_roundtrips() {
        let frame = stream_end_frame(0, 5, 1);
        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_stream_end(&decoded), eq(&Ok(1_u32)));
    }

    #[rstest]
    fn truncated_payload_is_rejected() {
        let frame = stream_end_frame(0, 5, 1);
        let mut encoded = frame.encode().expect("encodes");
        let _ = encoded.pop();

        let error = DcpFrame::decode(&encoded).expect_err("truncated payload must fail");
        let DcpError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("unexpected end of payload"), eq(true));
    }

    #[rstest]
    fn expiration_frame_roundtrips() {
        use super::{ExpirationBody, expiration_frame, parse_expiration};
        let body = ExpirationBody {
            by_seqno: 8,
            rev_seqno: 2,
            delete_time: 1_700_000_000,
        };
        let frame = expiration_frame(1, 3, body, b"stale".to_vec());
        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_expiration(&decoded), eq(&Ok(body)));
    }

    #[rstest]
    fn system_event_frame_roundtrips() {
        use super::{SystemEventBody, parse_system_event, system_event_frame};
        let body = SystemEventBody {
            by_seqno: 12,
            event: 0,
            version: 1,
        };
        let frame = system_event_frame(0, 4, body, b"collection".to_vec(), vec![9, 9]);
        let decoded = DcpFrame::decode(&frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_system_event(&decoded), eq(&Ok(body)));
        assert_that!(decoded.value, eq(&vec![9_u8, 9]));
    }

    #[rstest]
    fn set_vbucket_state_and_noop_frames_encode_minimal_bodies() {
        use super::{HEADER_LEN, noop_frame, parse_set_vbucket_state, set_vbucket_state_frame};
        let state_frame = set_vbucket_state_frame(2, 5, 1);
        let decoded =
            DcpFrame::decode(&state_frame.encode().expect("encodes")).expect("decodes");
        assert_that!(parse_set_vbucket_state(&decoded), eq(&Ok(1_u8)));

        let noop = noop_frame(7);
        assert_that!(noop.wire_len(), eq(HEADER_LEN));
    }

    #[rstest]
    fn unknown_opcode_is_rejected() {
        let frame = stream_end_frame(0, 5, 1);
        let mut encoded = frame.encode().expect("encodes");
        encoded[1] = 0x42;

        let error = DcpFrame::decode(&encoded).expect_err("unknown opcode must fail");
        let DcpError::Protocol(message) = error else {
            panic!("expected protocol error");
        };
        assert_that!(message.contains("unknown opcode"), eq(true));
    }
}
