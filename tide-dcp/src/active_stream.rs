//! Producer-side stream state machine.
//!
//! An active stream moves monotonically through
//! `pending → backfilling → in-memory → (takeover-send → takeover-wait →) dead`, converting
//! checkpoint and backfill items into wire responses while honoring snapshot containment.

use tracing::debug;

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Opaque, Seqno, VbUuid, Vbid};
use tide_proto::message::{MarkerFlags, StreamEndReason};
use tide_proto::value::{TransportPolicy, encode_for_transport};
use tide_storage::checkpoint::CursorEntry;
use tide_storage::item::{Item, ItemOp};
use tide_storage::vbucket::VbState;

use crate::response::{DcpResponse, MutationEvent, MutationResponse, ReadyQueue};

/// Stream-request flag asking for a takeover stream.
pub const STREAM_FLAG_TAKEOVER: u32 = 0x01;

/// Lifecycle states of a producer-side stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveStreamState {
    /// Created, not yet scheduled.
    Pending,
    /// Historical items are being read from disk.
    Backfilling,
    /// Items are drained from in-memory checkpoints.
    InMemory,
    /// Takeover: draining the final items and sending the state handoff.
    TakeoverSend,
    /// Takeover: waiting for the consumer to acknowledge the handoff.
    TakeoverWait,
    /// Terminal.
    Dead,
}

impl ActiveStreamState {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Backfilling => 1,
            Self::InMemory => 2,
            Self::TakeoverSend => 3,
            Self::TakeoverWait => 4,
            Self::Dead => 5,
        }
    }
}

/// Producer-side stream for one vBucket.
#[derive(Debug)]
pub struct ActiveStream {
    vbid: Vbid,
    opaque: Opaque,
    start_seqno: Seqno,
    end_seqno: Seqno,
    vb_uuid: VbUuid,
    snap_start_seqno: Seqno,
    snap_end_seqno: Seqno,
    takeover: bool,
    state: ActiveStreamState,
    ready: ReadyQueue,
    cursor_name: String,
    last_sent_seqno: Seqno,
    policy: TransportPolicy,
    no_value: bool,
}

impl ActiveStream {
    /// Creates a pending stream from accepted stream-request arguments.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vbid: Vbid,
        opaque: Opaque,
        flags: u32,
        start_seqno: Seqno,
        end_seqno: Seqno,
        vb_uuid: VbUuid,
        snap_start_seqno: Seqno,
        snap_end_seqno: Seqno,
        cursor_name: String,
        policy: TransportPolicy,
        no_value: bool,
    ) -> Self {
        Self {
            vbid,
            opaque,
            start_seqno,
            end_seqno,
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
            takeover: flags & STREAM_FLAG_TAKEOVER != 0,
            state: ActiveStreamState::Pending,
            ready: ReadyQueue::new(),
            cursor_name,
            last_sent_seqno: start_seqno,
            policy,
            no_value,
        }
    }

    /// Returns the vBucket this stream serves.
    #[must_use]
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Returns the stream opaque.
    #[must_use]
    pub fn opaque(&self) -> Opaque {
        self.opaque
    }

    /// Returns the claimed vBucket instance id.
    #[must_use]
    pub fn vb_uuid(&self) -> VbUuid {
        self.vb_uuid
    }

    /// Returns the requested start seqno.
    #[must_use]
    pub fn start_seqno(&self) -> Seqno {
        self.start_seqno
    }

    /// Returns the claimed snapshot range.
    #[must_use]
    pub fn snapshot_range(&self) -> (Seqno, Seqno) {
        (self.snap_start_seqno, self.snap_end_seqno)
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ActiveStreamState {
        self.state
    }

    /// Returns whether this is a takeover stream.
    #[must_use]
    pub fn is_takeover(&self) -> bool {
        self.takeover
    }

    /// Name of the checkpoint cursor registered for this stream.
    #[must_use]
    pub fn cursor_name(&self) -> &str {
        &self.cursor_name
    }

    /// Highest seqno handed to the ready queue so far.
    #[must_use]
    pub fn last_sent_seqno(&self) -> Seqno {
        self.last_sent_seqno
    }

    /// Returns whether responses are waiting for the writer.
    #[must_use]
    pub fn items_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of queued responses (test visibility).
    #[must_use]
    pub fn ready_queue_len(&self) -> usize {
        self.ready.len()
    }

    /// Total wire bytes queued, used by backfill pacing.
    #[must_use]
    pub fn ready_bytes(&self) -> usize {
        self.ready.bytes()
    }

    fn transition(&mut self, next: ActiveStreamState) -> DcpResult<()> {
        if next.rank() <= self.state.rank() && next != ActiveStreamState::Dead {
            return Err(DcpError::Failed("illegal stream state transition"));
        }
        debug!(vbid = self.vbid, from = ?self.state, to = ?next, "active stream transition");
        self.state = next;
        Ok(())
    }

    /// Enters the backfilling phase.
    pub fn mark_backfilling(&mut self) -> DcpResult<()> {
        self.transition(ActiveStreamState::Backfilling)
    }

    /// Enters the in-memory phase (directly from pending, or after a backfill finishes).
    pub fn mark_in_memory(&mut self) -> DcpResult<()> {
        self.transition(ActiveStreamState::InMemory)
    }

    fn push_item(&mut self, item: Item, event: MutationEvent) -> DcpResult<()> {
        if item.by_seqno <= self.last_sent_seqno {
            return Err(DcpError::Failed("stream seqno went backwards"));
        }
        if self.end_seqno != Seqno::MAX && item.by_seqno > self.end_seqno {
            return Ok(());
        }

        let (value, datatype) = if self.no_value {
            (Vec::new(), 0)
        } else {
            encode_for_transport(&item.value, item.datatype, self.policy)?
        };
        let mut wire_item = item;
        wire_item.value = value;
        wire_item.datatype = datatype;

        self.last_sent_seqno = wire_item.by_seqno;
        self.ready.push(DcpResponse::Mutation(MutationResponse {
            opaque: self.opaque,
            item: wire_item,
            ext_meta: Vec::new(),
            event,
        }));
        Ok(())
    }

    fn event_for(item: &Item) -> MutationEvent {
        match item.op {
            ItemOp::Deletion => MutationEvent::Deletion,
            ItemOp::Expiration => MutationEvent::Expiration,
            ItemOp::Prepare => MutationEvent::Prepare,
            ItemOp::Mutation | ItemOp::SystemEvent => MutationEvent::Mutation,
        }
    }

    /// Queues one backfill snapshot: a disk-flag marker followed by the scanned items.
    ///
    /// # Errors
    ///
    /// Fails when called outside the backfilling phase or when item order regresses.
    pub fn accept_backfill_snapshot(
        &mut self,
        snapshot_end: Seqno,
        items: Vec<Item>,
    ) -> DcpResult<()> {
        if self.state != ActiveStreamState::Backfilling {
            return Err(DcpError::Failed("backfill items outside backfill phase"));
        }
        let marker_start = items
            .first()
            .map_or(self.start_seqno, |item| item.by_seqno);
        self.ready.push(DcpResponse::SnapshotMarker {
            vbid: self.vbid,
            opaque: self.opaque,
            start_seqno: marker_start,
            end_seqno: snapshot_end,
            flags: MarkerFlags::DISK,
        });
        for item in items {
            let event = Self::event_for(&item);
            self.push_item(item, event)?;
        }
        Ok(())
    }

    /// Queues further items inside the current backfill snapshot.
    pub fn accept_backfill_items(&mut self, items: Vec<Item>) -> DcpResult<()> {
        if self.state != ActiveStreamState::Backfilling {
            return Err(DcpError::Failed("backfill items outside backfill phase"));
        }
        for item in items {
            let event = Self::event_for(&item);
            self.push_item(item, event)?;
        }
        Ok(())
    }

    /// Marks the backfill complete; streaming continues from in-memory checkpoints.
    pub fn complete_backfill(&mut self) -> DcpResult<()> {
        self.mark_in_memory()
    }

    /// Converts one cursor batch into wire responses.
    ///
    /// Exactly one snapshot marker precedes each contiguous run of items; checkpoint
    /// boundaries split runs.
    pub fn process_cursor_entries(&mut self, entries: Vec<CursorEntry>) -> DcpResult<()> {
        if self.state != ActiveStreamState::InMemory {
            return Err(DcpError::Failed("cursor items outside in-memory phase"));
        }

        let mut run: Vec<Item> = Vec::new();
        for entry in entries {
            match entry {
                CursorEntry::Item(item) => run.push(item),
                CursorEntry::CheckpointStart { .. } | CursorEntry::CheckpointEnd { .. } => {
                    self.flush_run(&mut run)?;
                }
            }
        }
        self.flush_run(&mut run)?;

        if self.end_seqno != Seqno::MAX && self.last_sent_seqno >= self.end_seqno {
            self.ready.push(DcpResponse::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason: StreamEndReason::Ok,
            });
            self.state = ActiveStreamState::Dead;
        }
        Ok(())
    }

    fn flush_run(&mut self, run: &mut Vec<Item>) -> DcpResult<()> {
        if run.is_empty() {
            return Ok(());
        }
        let start = run[0].by_seqno;
        let end = run[run.len() - 1].by_seqno;
        self.ready.push(DcpResponse::SnapshotMarker {
            vbid: self.vbid,
            opaque: self.opaque,
            start_seqno: start,
            end_seqno: end,
            flags: MarkerFlags::MEMORY | MarkerFlags::CHECKPOINT,
        });
        for item in run.drain(..) {
            let event = Self::event_for(&item);
            self.push_item(item, event)?;
        }
        Ok(())
    }

    /// Starts the takeover handoff once the in-memory phase has drained.
    pub fn begin_takeover(&mut self) -> DcpResult<()> {
        if !self.takeover {
            return Err(DcpError::Failed("takeover on a non-takeover stream"));
        }
        self.transition(ActiveStreamState::TakeoverSend)
    }

    /// Consumer acknowledged the state handoff; the stream finishes.
    pub fn handle_takeover_ack(&mut self) -> DcpResult<()> {
        if self.state != ActiveStreamState::TakeoverWait {
            return Err(DcpError::Failed("takeover ack outside takeover-wait"));
        }
        self.ready.push(DcpResponse::StreamEnd {
            vbid: self.vbid,
            opaque: self.opaque,
            reason: StreamEndReason::StateChanged,
        });
        self.state = ActiveStreamState::Dead;
        Ok(())
    }

    /// Pops the next response for the writer, materializing takeover handoffs on demand.
    pub fn next_response(&mut self) -> Option<DcpResponse> {
        if let Some(response) = self.ready.pop() {
            return Some(response);
        }
        if self.state == ActiveStreamState::TakeoverSend {
            self.state = ActiveStreamState::TakeoverWait;
            return Some(DcpResponse::SetVbucketState {
                vbid: self.vbid,
                opaque: self.opaque,
                state: VbState::Active,
            });
        }
        None
    }

    /// Peeks the size of the next response without removing it.
    #[must_use]
    pub fn next_response_size(&self) -> Option<usize> {
        if let Some(front) = self.ready.front() {
            return Some(front.message_size());
        }
        if self.state == ActiveStreamState::TakeoverSend {
            return Some(
                DcpResponse::SetVbucketState {
                    vbid: self.vbid,
                    opaque: self.opaque,
                    state: VbState::Active,
                }
                .message_size(),
            );
        }
        None
    }

    /// Terminates the stream.
    ///
    /// With `send_end` the terminal state still emits a stream-end carrying `reason`; without
    /// it the caller removes the stream synchronously.
    pub fn close(&mut self, reason: StreamEndReason, send_end: bool) {
        if send_end && self.state != ActiveStreamState::Dead {
            self.ready.push(DcpResponse::StreamEnd {
                vbid: self.vbid,
                opaque: self.opaque,
                reason,
            });
        }
        self.state = ActiveStreamState::Dead;
    }

    /// Returns whether a dead stream has drained everything it still owed the wire.
    #[must_use]
    pub fn is_drained_dead(&self) -> bool {
        self.state == ActiveStreamState::Dead && self.ready.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ActiveStream, ActiveStreamState, STREAM_FLAG_TAKEOVER};
    use crate::response::DcpResponse;
    use googletest::prelude::*;
    use rstest::rstest;
    use tide_proto::message::{MarkerFlags, StreamEndReason};
    use tide_proto::value::TransportPolicy;
    use tide_storage::checkpoint::CursorEntry;
    use tide_storage::item::Item;

    fn sequenced(seqno: u64) -> Item {
        let mut item = Item::mutation(0, format!("key-{seqno}").into_bytes(), b"v".to_vec());
        item.by_seqno = seqno;
        item
    }

    fn in_memory_stream(start: u64, end: u64) -> ActiveStream {
        let mut stream = ActiveStream::new(
            0,
            1,
            0,
            start,
            end,
            0xA0,
            start,
            start,
            "dcp:test:vb:0".to_owned(),
            TransportPolicy::default(),
            false,
        );
        stream.mark_in_memory().expect("pending to in-memory is legal");
        stream
    }

    #[rstest]
    fn states_only_move_forward() {
        let mut stream = in_memory_stream(0, u64::MAX);
        let error = stream.mark_backfilling().expect_err("cannot go backwards");
        assert_that!(format!("{error}").contains("illegal"), eq(true));
    }

    #[rstest]
    fn cursor_batch_emits_one_marker_per_contiguous_run() {
        let mut stream = in_memory_stream(0, u64::MAX);
        stream
            .process_cursor_entries(vec![
                CursorEntry::CheckpointStart { checkpoint_id: 1 },
                CursorEntry::Item(sequenced(1)),
                CursorEntry::Item(sequenced(2)),
                CursorEntry::CheckpointEnd { checkpoint_id: 1 },
                CursorEntry::CheckpointStart { checkpoint_id: 2 },
                CursorEntry::Item(sequenced(3)),
            ])
            .expect("batch processes");

        let first = stream.next_response().expect("marker");
        let DcpResponse::SnapshotMarker {
            start_seqno,
            end_seqno,
            flags,
            ..
        } = first
        else {
            panic!("expected a snapshot marker first");
        };
        assert_that!(start_seqno, eq(1_u64));
        assert_that!(end_seqno, eq(2_u64));
        assert_that!(flags & MarkerFlags::MEMORY, eq(MarkerFlags::MEMORY));

        let seqnos = std::iter::from_fn(|| stream.next_response())
            .filter_map(|response| response.by_seqno())
            .collect::<Vec<_>>();
        assert_that!(seqnos, eq(&vec![1_u64, 2, 3]));
    }

    #[rstest]
    fn emitted_seqnos_are_strictly_monotonic() {
        let mut stream = in_memory_stream(0, u64::MAX);
        stream
            .process_cursor_entries(vec![
                CursorEntry::Item(sequenced(1)),
                CursorEntry::Item(sequenced(2)),
            ])
            .expect("batch processes");

        let error = stream
            .process_cursor_entries(vec![CursorEntry::Item(sequenced(2))])
            .expect_err("regressing seqno must fail");
        assert_that!(format!("{error}").contains("backwards"), eq(true));
    }

    #[rstest]
    fn bounded_stream_ends_at_its_end_seqno() {
        let mut stream = in_memory_stream(0, 2);
        stream
            .process_cursor_entries(vec![
                CursorEntry::Item(sequenced(1)),
                CursorEntry::Item(sequenced(2)),
            ])
            .expect("batch processes");

        let mut saw_end = false;
        while let Some(response) = stream.next_response() {
            if let DcpResponse::StreamEnd { reason, .. } = response {
                assert_that!(reason, eq(StreamEndReason::Ok));
                saw_end = true;
            }
        }
        assert_that!(saw_end, eq(true));
        assert_that!(stream.state(), eq(ActiveStreamState::Dead));
        assert_that!(stream.is_drained_dead(), eq(true));
    }

    #[rstest]
    fn backfill_snapshot_emits_a_disk_marker() {
        let mut stream = ActiveStream::new(
            0,
            1,
            0,
            0,
            u64::MAX,
            0xA0,
            0,
            0,
            "dcp:test:vb:0".to_owned(),
            TransportPolicy::default(),
            false,
        );
        stream.mark_backfilling().expect("pending to backfilling");
        stream
            .accept_backfill_snapshot(2, vec![sequenced(1), sequenced(2)])
            .expect("backfill batch");
        stream.complete_backfill().expect("backfill to in-memory");

        let DcpResponse::SnapshotMarker { flags, .. } =
            stream.next_response().expect("marker")
        else {
            panic!("expected a snapshot marker first");
        };
        assert_that!(flags, eq(MarkerFlags::DISK));
        assert_that!(stream.state(), eq(ActiveStreamState::InMemory));
    }

    #[rstest]
    fn takeover_handoff_walks_send_wait_dead() {
        let mut stream = ActiveStream::new(
            0,
            1,
            STREAM_FLAG_TAKEOVER,
            0,
            u64::MAX,
            0xA0,
            0,
            0,
            "dcp:test:vb:0".to_owned(),
            TransportPolicy::default(),
            false,
        );
        stream.mark_in_memory().expect("pending to in-memory");
        stream.begin_takeover().expect("takeover begins");

        let handoff = stream.next_response().expect("handoff message");
        assert_that!(
            matches!(handoff, DcpResponse::SetVbucketState { .. }),
            eq(true)
        );
        assert_that!(stream.state(), eq(ActiveStreamState::TakeoverWait));

        stream.handle_takeover_ack().expect("ack accepted");
        let end = stream.next_response().expect("stream end");
        let DcpResponse::StreamEnd { reason, .. } = end else {
            panic!("expected stream end");
        };
        assert_that!(reason, eq(StreamEndReason::StateChanged));
        assert_that!(stream.state(), eq(ActiveStreamState::Dead));
    }

    #[rstest]
    fn close_with_negotiated_end_keeps_the_end_message() {
        let mut stream = in_memory_stream(0, u64::MAX);
        stream.close(StreamEndReason::Closed, true);

        assert_that!(stream.state(), eq(ActiveStreamState::Dead));
        assert_that!(stream.is_drained_dead(), eq(false));
        let DcpResponse::StreamEnd { reason, .. } =
            stream.next_response().expect("end message")
        else {
            panic!("expected stream end");
        };
        assert_that!(reason, eq(StreamEndReason::Closed));
        assert_that!(stream.is_drained_dead(), eq(true));
    }
}
