//! Consumer-side stream state machine.
//!
//! A passive stream absorbs snapshot markers and document messages, buffering them while the
//! storage engine is overcommitted and emitting seqno acknowledgements for synchronous
//! replication. The buffering discipline guarantees that while any message for the vBucket is
//! buffered, every newer message is buffered behind it, preserving seqno monotonicity across
//! the concurrent front-end and processor paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Opaque, Seqno, Vbid};
use tide_proto::message::MarkerFlags;
use tide_storage::item::Item;
use tide_storage::vbucket::Vbucket;

use crate::response::{DcpResponse, MutationEvent, ReadyQueue, SeqnoAckResponse};

/// Lifecycle states of a consumer-side stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveStreamState {
    /// Created, handshake not sent yet.
    Pending,
    /// Handshake queued; waiting for the first snapshot marker.
    AwaitingFirstSnapshot,
    /// Inside a snapshot window.
    Reading,
    /// Terminal.
    Dead,
}

/// Behavior when storage refuses ingest for resource reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottlePolicy {
    /// Buffer the message and retry from the processor task.
    Buffer,
    /// Escalate to a connection disconnect (ephemeral fail-new-data).
    Disconnect,
}

/// Outcome of one buffered-processor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessBufferedResult {
    /// The buffer is empty.
    AllProcessed,
    /// The batch bound was reached with messages still buffered.
    MoreToProcess,
    /// Storage still refuses ingest; retry later.
    CannotProcess,
}

/// One document message as received from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Stream correlation value.
    pub opaque: Opaque,
    /// The document carried by the message.
    pub item: Item,
    /// Trailing meta section bytes.
    pub ext_meta: Vec<u8>,
    /// Message kind.
    pub event: MutationEvent,
}

impl ConsumerMessage {
    /// Exact wire size of this message, mirroring the producer-side accounting.
    #[must_use]
    pub fn message_size(&self) -> usize {
        use tide_proto::codec::{DELETION_BASE_MSG_BYTES, MUTATION_BASE_MSG_BYTES};
        let base = match self.event {
            MutationEvent::Mutation | MutationEvent::Prepare => MUTATION_BASE_MSG_BYTES,
            MutationEvent::Deletion | MutationEvent::Expiration => DELETION_BASE_MSG_BYTES,
        };
        base + self.item.key.len() + self.item.value.len() + self.ext_meta.len()
    }
}

/// A message parked while storage was overcommitted.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BufferedMessage {
    Marker {
        start_seqno: Seqno,
        end_seqno: Seqno,
        flags: u32,
    },
    Message(ConsumerMessage),
}

#[derive(Debug, Default)]
struct MessageBuffer {
    messages: VecDeque<BufferedMessage>,
    bytes: usize,
}

/// Construction options for a passive stream.
#[derive(Debug, Clone, Copy)]
pub struct PassiveStreamOptions {
    /// Seqno the consumer already holds.
    pub start_seqno: Seqno,
    /// Whether seqno acknowledgements are negotiated.
    pub sync_replication: bool,
    /// Resource-pressure escalation policy.
    pub throttle_policy: ThrottlePolicy,
    /// Whether disk-phase markers route through the backfill queue.
    pub disk_backfill_queue: bool,
}

/// Consumer-side stream for one vBucket.
pub struct PassiveStream {
    vbid: Vbid,
    opaque: Opaque,
    vbucket: Arc<Mutex<Vbucket>>,
    options: PassiveStreamOptions,
    state: Mutex<PassiveStreamState>,
    ready: Mutex<ReadyQueue>,
    buffer: Mutex<MessageBuffer>,
    cur_snapshot: Mutex<Option<(Seqno, Seqno)>>,
    last_response_message_size: AtomicUsize,
    #[allow(clippy::type_complexity)]
    process_hook: Mutex<Option<Box<dyn Fn() + Send>>>,
}

impl std::fmt::Debug for PassiveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassiveStream")
            .field("vbid", &self.vbid)
            .field("opaque", &self.opaque)
            .field("state", &self.state())
            .field("buffered", &self.num_buffer_items())
            .finish_non_exhaustive()
    }
}

impl PassiveStream {
    /// Creates the stream and queues its stream-request handshake message.
    #[must_use]
    pub fn new(
        vbid: Vbid,
        opaque: Opaque,
        vbucket: Arc<Mutex<Vbucket>>,
        options: PassiveStreamOptions,
    ) -> Self {
        let mut ready = ReadyQueue::new();
        ready.push(DcpResponse::StreamReq {
            vbid,
            opaque,
            start_seqno: options.start_seqno,
        });
        Self {
            vbid,
            opaque,
            vbucket,
            options,
            state: Mutex::new(PassiveStreamState::AwaitingFirstSnapshot),
            ready: Mutex::new(ready),
            buffer: Mutex::new(MessageBuffer::default()),
            cur_snapshot: Mutex::new(None),
            last_response_message_size: AtomicUsize::new(0),
            process_hook: Mutex::new(None),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
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

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> PassiveStreamState {
        *Self::lock(&self.state)
    }

    /// Returns whether the stream is still live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() != PassiveStreamState::Dead
    }

    /// Wire size of the last message accounted by this stream.
    #[must_use]
    pub fn response_message_size(&self) -> usize {
        self.last_response_message_size.load(Ordering::Acquire)
    }

    /// Seqno window set by the most recent snapshot marker.
    #[must_use]
    pub fn current_snapshot(&self) -> Option<(Seqno, Seqno)> {
        *Self::lock(&self.cur_snapshot)
    }

    /// Number of buffered messages.
    #[must_use]
    pub fn num_buffer_items(&self) -> usize {
        Self::lock(&self.buffer).messages.len()
    }

    /// Bytes parked in the buffer.
    #[must_use]
    pub fn buffer_bytes(&self) -> usize {
        Self::lock(&self.buffer).bytes
    }

    /// Seqnos of buffered document messages, oldest first (test visibility).
    #[must_use]
    pub fn buffered_seqnos(&self) -> Vec<Seqno> {
        Self::lock(&self.buffer)
            .messages
            .iter()
            .filter_map(|entry| match entry {
                BufferedMessage::Message(message) => Some(message.item.by_seqno),
                BufferedMessage::Marker { .. } => None,
            })
            .collect()
    }

    /// Installs a hook invoked between buffered-processor iterations (deterministic tests).
    pub fn set_process_hook(&self, hook: Box<dyn Fn() + Send>) {
        *Self::lock(&self.process_hook) = Some(hook);
    }

    /// Number of responses queued for the writer.
    #[must_use]
    pub fn ready_queue_len(&self) -> usize {
        Self::lock(&self.ready).len()
    }

    /// Peeks the oldest queued response.
    #[must_use]
    pub fn front_ready(&self) -> Option<DcpResponse> {
        Self::lock(&self.ready).front().cloned()
    }

    /// Pops the oldest queued response.
    pub fn pop_ready(&self) -> Option<DcpResponse> {
        Self::lock(&self.ready).pop()
    }

    /// Handles an incoming snapshot marker.
    ///
    /// Buffered messages force the marker to buffer behind them; otherwise it applies
    /// immediately.
    pub fn marker_received(
        &self,
        start_seqno: Seqno,
        end_seqno: Seqno,
        flags: u32,
    ) -> DcpResult<()> {
        let mut buffer = Self::lock(&self.buffer);
        if !buffer.messages.is_empty() {
            buffer.messages.push_back(BufferedMessage::Marker {
                start_seqno,
                end_seqno,
                flags,
            });
            return Err(DcpError::TempFail("messages buffered ahead of marker"));
        }
        drop(buffer);
        self.apply_marker(start_seqno, end_seqno, flags);
        Ok(())
    }

    fn apply_marker(&self, start_seqno: Seqno, end_seqno: Seqno, flags: u32) {
        debug!(
            vbid = self.vbid,
            start_seqno, end_seqno, flags, "snapshot marker"
        );
        *Self::lock(&self.cur_snapshot) = Some((start_seqno, end_seqno));
        {
            let mut state = Self::lock(&self.state);
            if *state == PassiveStreamState::AwaitingFirstSnapshot
                || *state == PassiveStreamState::Pending
            {
                *state = PassiveStreamState::Reading;
            }
        }

        let mut vbucket = Self::lock(&self.vbucket);
        if flags & MarkerFlags::DISK != 0 {
            vbucket.set_receiving_disk_snapshot(end_seqno);
            if self.options.disk_backfill_queue {
                vbucket.checkpoints.set_open_checkpoint_id(0);
            }
        } else {
            if vbucket.checkpoints.open_checkpoint_id() == 0 {
                let _ = vbucket.checkpoints.create_checkpoint();
            }
            if vbucket.is_receiving_disk_snapshot() {
                vbucket.clear_disk_snapshot();
            }
        }
    }

    /// Handles one incoming document message.
    ///
    /// # Errors
    ///
    /// `TempFail` when the message was buffered (either because older messages are buffered or
    /// because storage is overcommitted under the buffering policy); `Disconnect` when the
    /// ephemeral fail-new-data policy escalates.
    pub fn message_received(&self, message: ConsumerMessage) -> DcpResult<()> {
        self.last_response_message_size
            .store(message.message_size(), Ordering::Release);

        let mut buffer = Self::lock(&self.buffer);
        if !buffer.messages.is_empty() {
            buffer.bytes += message.message_size();
            buffer.messages.push_back(BufferedMessage::Message(message));
            return Err(DcpError::TempFail("older messages still buffered"));
        }

        match self.apply_message(&message) {
            Ok(()) => Ok(()),
            Err(DcpError::TempFail(reason)) => match self.options.throttle_policy {
                ThrottlePolicy::Buffer => {
                    buffer.bytes += message.message_size();
                    buffer.messages.push_back(BufferedMessage::Message(message));
                    Err(DcpError::TempFail(reason))
                }
                ThrottlePolicy::Disconnect => {
                    Err(DcpError::Disconnect("ephemeral bucket refuses new data"))
                }
            },
            Err(other) => Err(other),
        }
    }

    fn apply_message(&self, message: &ConsumerMessage) -> DcpResult<()> {
        let seqno = {
            let mut vbucket = Self::lock(&self.vbucket);
            vbucket.apply_replicated(message.item.clone())?
        };
        if message.event == MutationEvent::Prepare && self.options.sync_replication {
            Self::lock(&self.ready).push(DcpResponse::SeqnoAck(SeqnoAckResponse::new(
                self.vbid, self.opaque, seqno, 0,
            )));
        }
        Ok(())
    }

    /// Drains buffered messages toward storage, up to `batch_limit` document messages.
    ///
    /// Messages are removed only after storage accepts them, so a front-end thread observing
    /// the buffer mid-drain still sees its own message ordered behind the parked ones.
    pub fn process_buffered_messages(&self, batch_limit: usize) -> ProcessBufferedResult {
        let mut processed = 0_usize;
        loop {
            if processed >= batch_limit.max(1) {
                return if self.num_buffer_items() == 0 {
                    ProcessBufferedResult::AllProcessed
                } else {
                    ProcessBufferedResult::MoreToProcess
                };
            }

            let front = {
                let buffer = Self::lock(&self.buffer);
                match buffer.messages.front() {
                    Some(entry) => entry.clone(),
                    None => return ProcessBufferedResult::AllProcessed,
                }
            };

            if let Some(hook) = Self::lock(&self.process_hook).as_ref() {
                hook();
            }

            match front {
                BufferedMessage::Marker {
                    start_seqno,
                    end_seqno,
                    flags,
                } => {
                    self.apply_marker(start_seqno, end_seqno, flags);
                    let mut buffer = Self::lock(&self.buffer);
                    let _ = buffer.messages.pop_front();
                }
                BufferedMessage::Message(message) => {
                    if self.apply_message(&message).is_err() {
                        return ProcessBufferedResult::CannotProcess;
                    }
                    let mut buffer = Self::lock(&self.buffer);
                    let _ = buffer.messages.pop_front();
                    buffer.bytes = buffer.bytes.saturating_sub(message.message_size());
                    processed += 1;
                }
            }
        }
    }

    /// Records persistence of a flush batch whose highest prepare was `persisted_prepare`.
    pub fn handle_persistence(&self, persisted_prepare: Seqno) {
        if !self.options.sync_replication {
            return;
        }
        Self::lock(&self.ready).push(DcpResponse::SeqnoAck(SeqnoAckResponse::new(
            self.vbid,
            self.opaque,
            persisted_prepare,
            persisted_prepare,
        )));
    }

    /// Handles a stream-end message from the producer.
    pub fn stream_end_received(&self) {
        *Self::lock(&self.state) = PassiveStreamState::Dead;
    }

    /// Terminates the stream.
    pub fn close(&self) {
        *Self::lock(&self.state) = PassiveStreamState::Dead;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConsumerMessage, PassiveStream, PassiveStreamOptions, PassiveStreamState,
        ProcessBufferedResult, ThrottlePolicy,
    };
    use crate::response::{DcpResponse, MutationEvent};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};
    use tide_proto::message::MarkerFlags;
    use tide_storage::item::{DurabilityRequirement, Item, ItemOp};
    use tide_storage::memory::MemoryTracker;
    use tide_storage::vbucket::{VbState, Vbucket};

    fn replica_vbucket(memory: &Arc<MemoryTracker>) -> Arc<Mutex<Vbucket>> {
        Arc::new(Mutex::new(Vbucket::new(
            0,
            VbState::Replica,
            0xA0,
            Arc::clone(memory),
        )))
    }

    fn stream_options(sync_replication: bool) -> PassiveStreamOptions {
        PassiveStreamOptions {
            start_seqno: 0,
            sync_replication,
            throttle_policy: ThrottlePolicy::Buffer,
            disk_backfill_queue: true,
        }
    }

    fn message(seqno: u64, value: &[u8]) -> ConsumerMessage {
        let mut item = Item::mutation(0, format!("key-{seqno}").into_bytes(), value.to_vec());
        item.by_seqno = seqno;
        ConsumerMessage {
            opaque: 0,
            item,
            ext_meta: Vec::new(),
            event: MutationEvent::Mutation,
        }
    }

    fn prepare_message(seqno: u64) -> ConsumerMessage {
        let mut item = Item::mutation(0, format!("key-{seqno}").into_bytes(), b"value".to_vec());
        item.by_seqno = seqno;
        item.op = ItemOp::Prepare;
        item.durability = Some(DurabilityRequirement::default());
        ConsumerMessage {
            opaque: 0,
            item,
            ext_meta: Vec::new(),
            event: MutationEvent::Prepare,
        }
    }

    fn drain_handshake(stream: &PassiveStream) {
        let front = stream.front_ready().expect("handshake queued");
        assert_that!(matches!(front, DcpResponse::StreamReq { .. }), eq(true));
        let _ = stream.pop_ready();
    }

    #[rstest]
    fn new_stream_queues_its_handshake_and_awaits_a_snapshot() {
        let memory = Arc::new(MemoryTracker::new(1 << 20, 0.9));
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), stream_options(false));
        assert_that!(
            stream.state(),
            eq(PassiveStreamState::AwaitingFirstSnapshot)
        );
        drain_handshake(&stream);

        stream
            .marker_received(1, 10, MarkerFlags::MEMORY)
            .expect("marker applies");
        assert_that!(stream.state(), eq(PassiveStreamState::Reading));
        assert_that!(stream.current_snapshot(), eq(Some((1_u64, 10_u64))));
        assert_that!(stream.is_active(), eq(true));
    }

    #[rstest]
    fn memory_pressure_buffers_and_keeps_buffering_behind() {
        let memory = Arc::new(MemoryTracker::new(100, 0.5));
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), stream_options(false));
        drain_handshake(&stream);
        stream
            .marker_received(1, 100, MarkerFlags::MEMORY)
            .expect("marker applies");

        memory.account_alloc(90);
        let error = stream
            .message_received(message(1, b"x"))
            .expect_err("throttled message buffers");
        assert_that!(error.is_would_block(), eq(false));
        assert_that!(stream.num_buffer_items(), eq(1_usize));

        // Memory recovers, but the buffer is non-empty: newer messages must still buffer.
        memory.set_max_data_size(1 << 20);
        let error = stream
            .message_received(message(2, b"x"))
            .expect_err("newer message must buffer behind");
        assert_that!(format!("{error}").contains("buffered"), eq(true));
        assert_that!(stream.buffered_seqnos(), eq(&vec![1_u64, 2]));
    }

    #[rstest]
    fn buffered_messages_drain_in_order_once_pressure_relaxes() {
        let memory = Arc::new(MemoryTracker::new(100, 0.5));
        let vbucket = replica_vbucket(&memory);
        let stream = PassiveStream::new(0, 1, Arc::clone(&vbucket), stream_options(false));
        drain_handshake(&stream);
        stream
            .marker_received(1, 100, MarkerFlags::MEMORY)
            .expect("marker applies");

        memory.account_alloc(90);
        let _ = stream.message_received(message(1, b"x"));
        let _ = stream.message_received(message(2, b"x"));

        // Pressure still on: nothing can drain.
        assert_that!(
            stream.process_buffered_messages(10),
            eq(ProcessBufferedResult::CannotProcess)
        );

        memory.set_max_data_size(1 << 20);
        assert_that!(
            stream.process_buffered_messages(1),
            eq(ProcessBufferedResult::MoreToProcess)
        );
        assert_that!(
            stream.process_buffered_messages(10),
            eq(ProcessBufferedResult::AllProcessed)
        );

        let vb = vbucket.lock().expect("vbucket lock");
        assert_that!(vb.high_seqno(), eq(2_u64));
    }

    #[rstest]
    fn prepare_receipt_acks_in_memory_seqno_exactly_once() {
        let memory = Arc::new(MemoryTracker::new(1 << 20, 0.9));
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), stream_options(true));
        drain_handshake(&stream);
        stream
            .marker_received(1, 3, MarkerFlags::MEMORY)
            .expect("marker applies");

        stream.message_received(message(1, b"value")).expect("applies");
        assert_that!(stream.ready_queue_len(), eq(0_usize));

        stream.message_received(prepare_message(2)).expect("applies");
        assert_that!(stream.ready_queue_len(), eq(1_usize));
        let DcpResponse::SeqnoAck(ack) = stream.front_ready().expect("ack queued") else {
            panic!("expected a seqno ack");
        };
        assert_that!(ack.in_memory_seqno(), eq(2_u64.to_be()));
        assert_that!(ack.on_disk_seqno(), eq(0_u64));

        // The snapshot-end mutation adds no further ack.
        stream.message_received(message(3, b"value")).expect("applies");
        assert_that!(stream.ready_queue_len(), eq(1_usize));
    }

    #[rstest]
    fn persistence_ack_carries_both_seqnos() {
        let memory = Arc::new(MemoryTracker::new(1 << 20, 0.9));
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), stream_options(true));
        drain_handshake(&stream);

        stream.handle_persistence(3);
        let DcpResponse::SeqnoAck(ack) = stream.pop_ready().expect("ack queued") else {
            panic!("expected a seqno ack");
        };
        assert_that!(ack.in_memory_seqno(), eq(3_u64.to_be()));
        assert_that!(ack.on_disk_seqno(), eq(3_u64.to_be()));
    }

    #[rstest]
    fn ephemeral_fail_new_data_escalates_to_disconnect() {
        let memory = Arc::new(MemoryTracker::new(100, 0.5));
        let mut options = stream_options(false);
        options.throttle_policy = ThrottlePolicy::Disconnect;
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), options);
        drain_handshake(&stream);
        stream
            .marker_received(1, 100, MarkerFlags::MEMORY)
            .expect("marker applies");

        memory.account_alloc(90);
        let error = stream
            .message_received(message(1, b"x"))
            .expect_err("must escalate");
        assert_that!(matches!(error, tide_common::error::DcpError::Disconnect(_)), eq(true));
        assert_that!(stream.num_buffer_items(), eq(0_usize));
    }

    #[rstest]
    fn stream_end_receipt_kills_the_stream() {
        let memory = Arc::new(MemoryTracker::new(1 << 20, 0.9));
        let stream = PassiveStream::new(0, 1, replica_vbucket(&memory), stream_options(false));
        stream.stream_end_received();
        assert_that!(stream.state(), eq(PassiveStreamState::Dead));
        assert_that!(stream.is_active(), eq(false));
    }
}
