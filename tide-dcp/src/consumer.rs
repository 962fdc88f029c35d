//! Consumer connection: passive stream ownership, negotiation ladder, and buffered processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use hashbrown::HashMap;
use tracing::debug;

use tide_common::config::EphemeralFullPolicy;
use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Cas, Cookie, Opaque, Seqno, Vbid};
use tide_proto::codec::DcpFrame;
use tide_proto::message::{Opcode, Status};
use tide_storage::bucket::KvBucket;
use tide_storage::item::{DurabilityRequirement, Item, ItemOp};
use tide_storage::vbucket::{FlushResult, VbState};

use crate::flow_control::FlowControl;
use crate::passive_stream::{
    ConsumerMessage, PassiveStream, PassiveStreamOptions, ProcessBufferedResult, ThrottlePolicy,
};
use crate::producer::MessageSink;
use crate::response::{DcpResponse, MutationEvent};

/// Document messages drained per buffered-processor pass.
pub const PROCESS_BUFFERED_BATCH_LIMIT: usize = 100;

/// GetErrorMap negotiation progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetErrorMapState {
    /// The request has not been sent yet.
    PendingRequest,
    /// The request is on the wire; awaiting the producer's answer.
    PendingResponse,
    /// Negotiation finished (or was never needed).
    Skip,
}

/// Consumer side of one DCP connection.
#[derive(Debug)]
pub struct DcpConsumer {
    name: String,
    cookie: Cookie,
    bucket: Arc<KvBucket>,
    streams: Mutex<HashMap<Vbid, Arc<PassiveStream>>>,
    stream_opaque_counter: AtomicU32,
    pending_controls: Mutex<VecDeque<DcpResponse>>,
    flow_control: Mutex<FlowControl>,
    flow_control_negotiated: AtomicBool,
    get_error_map_state: Mutex<GetErrorMapState>,
    producer_is_version5_or_higher: AtomicBool,
    sync_replication: AtomicBool,
    paused: AtomicBool,
    disconnect_requested: AtomicBool,
    pending_disconnect: AtomicBool,
    last_message_time_ns: AtomicU64,
    epoch: Instant,
}

impl DcpConsumer {
    /// Creates a consumer connection, seeding its negotiation ladder from engine config.
    #[must_use]
    pub fn new(bucket: Arc<KvBucket>, cookie: Cookie, name: String) -> Self {
        let config = bucket.config().clone();
        let mut pending_controls = VecDeque::new();
        if config.dcp_enable_noop {
            pending_controls.push_back(DcpResponse::Control {
                key: "enable_noop".to_owned(),
                value: "true".to_owned(),
            });
            pending_controls.push_back(DcpResponse::Control {
                key: "set_noop_interval".to_owned(),
                value: config.dcp_noop_tx_interval_secs.to_string(),
            });
        }
        Self {
            name,
            cookie,
            flow_control: Mutex::new(FlowControl::from_config(&config)),
            bucket,
            streams: Mutex::new(HashMap::new()),
            stream_opaque_counter: AtomicU32::new(1),
            pending_controls: Mutex::new(pending_controls),
            flow_control_negotiated: AtomicBool::new(false),
            get_error_map_state: Mutex::new(GetErrorMapState::PendingRequest),
            producer_is_version5_or_higher: AtomicBool::new(false),
            sync_replication: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            pending_disconnect: AtomicBool::new(false),
            last_message_time_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Transport cookie owning this connection.
    #[must_use]
    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    /// Whether the front-end has parked this connection.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Flags the connection for teardown.
    pub fn flag_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::Release);
    }

    /// Whether the connection has been flagged for teardown.
    #[must_use]
    pub fn do_disconnect(&self) -> bool {
        self.disconnect_requested.load(Ordering::Acquire)
    }

    /// Enables the synchronous-replication handshake for streams created afterwards.
    pub fn enable_sync_replication(&self) {
        self.sync_replication.store(true, Ordering::Release);
        Self::lock(&self.pending_controls).push_back(DcpResponse::Control {
            key: "enable_sync_replication".to_owned(),
            value: "true".to_owned(),
        });
    }

    /// GetErrorMap negotiation progress (test visibility).
    #[must_use]
    pub fn get_error_map_state(&self) -> GetErrorMapState {
        *Self::lock(&self.get_error_map_state)
    }

    /// Whether the producer answered the GetErrorMap probe successfully.
    #[must_use]
    pub fn producer_is_version5_or_higher(&self) -> bool {
        self.producer_is_version5_or_higher.load(Ordering::Acquire)
    }

    /// Monotonic receive timestamp, in nanoseconds from connection creation.
    #[must_use]
    pub fn last_message_time(&self) -> u64 {
        self.last_message_time_ns.load(Ordering::Acquire)
    }

    fn touch_last_message_time(&self) {
        let now = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .last_message_time_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |previous| {
                Some(now.max(previous.saturating_add(1)))
            });
    }

    /// Creates a passive stream for one replica vBucket.
    ///
    /// A prior stream in the dead state is replaced with a fresh active one.
    pub fn add_stream(&self, _opaque: Opaque, vbid: Vbid, _flags: u32) -> DcpResult<()> {
        let vbucket = self.bucket.require_vbucket(vbid)?;
        {
            let vb = vbucket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if vb.state() != VbState::Replica {
                return Err(DcpError::NotSupported("vbucket is not a replica"));
            }
        }

        let mut streams = Self::lock(&self.streams);
        if let Some(existing) = streams.get(&vbid) {
            if existing.is_active() {
                return Err(DcpError::Failed("stream already exists for vbucket"));
            }
            let _ = streams.remove(&vbid);
        }

        let config = self.bucket.config();
        let throttle_policy = if config.ephemeral
            && config.ephemeral_full_policy == EphemeralFullPolicy::FailNewData
        {
            ThrottlePolicy::Disconnect
        } else {
            ThrottlePolicy::Buffer
        };
        let start_seqno = {
            let vb = vbucket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            vb.high_seqno()
        };
        let stream_opaque = self.stream_opaque_counter.fetch_add(1, Ordering::AcqRel);
        let stream = PassiveStream::new(
            vbid,
            stream_opaque,
            vbucket,
            PassiveStreamOptions {
                start_seqno,
                sync_replication: self.sync_replication.load(Ordering::Acquire),
                throttle_policy,
                disk_backfill_queue: config.disk_backfill_queue,
            },
        );
        debug!(connection = %self.name, vbid, stream_opaque, "passive stream added");
        streams.insert(vbid, Arc::new(stream));
        Ok(())
    }

    /// Returns the passive stream for one vBucket.
    #[must_use]
    pub fn get_vbucket_stream(&self, vbid: Vbid) -> Option<Arc<PassiveStream>> {
        Self::lock(&self.streams).get(&vbid).map(Arc::clone)
    }

    /// Closes the stream for one vBucket (it stays in place, dead, until replaced).
    pub fn close_stream(&self, _opaque: Opaque, vbid: Vbid) -> DcpResult<()> {
        let streams = Self::lock(&self.streams);
        let Some(stream) = streams.get(&vbid) else {
            return Err(DcpError::NotSupported("no stream for vbucket"));
        };
        stream.close();
        Ok(())
    }

    fn live_stream(&self, vbid: Vbid) -> DcpResult<Arc<PassiveStream>> {
        Self::lock(&self.streams)
            .get(&vbid)
            .filter(|stream| stream.is_active())
            .map(Arc::clone)
            .ok_or(DcpError::NotSupported("no live stream for vbucket"))
    }

    fn ingest(&self, vbid: Vbid, message: ConsumerMessage) -> DcpResult<()> {
        self.touch_last_message_time();
        let stream = self.live_stream(vbid)?;
        Self::lock(&self.flow_control).record_received(message.message_size());
        match stream.message_received(message) {
            Err(DcpError::Disconnect(reason)) => {
                self.pending_disconnect.store(true, Ordering::Release);
                Err(DcpError::Disconnect(reason))
            }
            other => other,
        }
    }

    /// Handles an incoming snapshot marker.
    pub fn snapshot_marker(
        &self,
        _opaque: Opaque,
        vbid: Vbid,
        start_seqno: Seqno,
        end_seqno: Seqno,
        flags: u32,
    ) -> DcpResult<()> {
        self.touch_last_message_time();
        let stream = self.live_stream(vbid)?;
        stream.marker_received(start_seqno, end_seqno, flags)
    }

    /// Handles an incoming mutation.
    #[allow(clippy::too_many_arguments)]
    pub fn mutation(
        &self,
        opaque: Opaque,
        vbid: Vbid,
        key: Vec<u8>,
        value: Vec<u8>,
        datatype: u8,
        cas: Cas,
        by_seqno: Seqno,
        rev_seqno: Seqno,
        ext_meta: Vec<u8>,
    ) -> DcpResult<()> {
        let mut item = Item::mutation(vbid, key, value);
        item.datatype = datatype;
        item.cas = cas;
        item.by_seqno = by_seqno;
        item.rev_seqno = rev_seqno;
        self.ingest(
            vbid,
            ConsumerMessage {
                opaque,
                item,
                ext_meta,
                event: MutationEvent::Mutation,
            },
        )
    }

    /// Handles an incoming deletion.
    #[allow(clippy::too_many_arguments)]
    pub fn deletion(
        &self,
        opaque: Opaque,
        vbid: Vbid,
        key: Vec<u8>,
        value: Vec<u8>,
        by_seqno: Seqno,
        rev_seqno: Seqno,
        ext_meta: Vec<u8>,
    ) -> DcpResult<()> {
        let mut item = Item::deletion(vbid, key);
        item.value = value;
        item.by_seqno = by_seqno;
        item.rev_seqno = rev_seqno;
        self.ingest(
            vbid,
            ConsumerMessage {
                opaque,
                item,
                ext_meta,
                event: MutationEvent::Deletion,
            },
        )
    }

    /// Handles an incoming expiration.
    pub fn expiration(
        &self,
        opaque: Opaque,
        vbid: Vbid,
        key: Vec<u8>,
        by_seqno: Seqno,
        rev_seqno: Seqno,
        ext_meta: Vec<u8>,
    ) -> DcpResult<()> {
        let mut item = Item::deletion(vbid, key);
        item.op = ItemOp::Expiration;
        item.by_seqno = by_seqno;
        item.rev_seqno = rev_seqno;
        self.ingest(
            vbid,
            ConsumerMessage {
                opaque,
                item,
                ext_meta,
                event: MutationEvent::Expiration,
            },
        )
    }

    /// Handles an incoming prepare (durable write).
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &self,
        opaque: Opaque,
        vbid: Vbid,
        key: Vec<u8>,
        value: Vec<u8>,
        by_seqno: Seqno,
        rev_seqno: Seqno,
        durability: DurabilityRequirement,
    ) -> DcpResult<()> {
        let mut item = Item::mutation(vbid, key, value);
        item.op = ItemOp::Prepare;
        item.by_seqno = by_seqno;
        item.rev_seqno = rev_seqno;
        item.durability = Some(durability);
        self.ingest(
            vbid,
            ConsumerMessage {
                opaque,
                item,
                ext_meta: Vec::new(),
                event: MutationEvent::Prepare,
            },
        )
    }

    /// Handles a stream-end from the producer.
    pub fn stream_end(&self, _opaque: Opaque, vbid: Vbid, _reason: u32) -> DcpResult<()> {
        self.touch_last_message_time();
        let stream = self.live_stream(vbid)?;
        stream.stream_end_received();
        Ok(())
    }

    /// Records persistence of a flush batch, feeding on-disk seqno acks.
    pub fn notify_vbucket_persisted(&self, vbid: Vbid, flush: FlushResult) {
        let Some(persisted_prepare) = flush.high_persisted_prepare else {
            return;
        };
        if let Some(stream) = self.get_vbucket_stream(vbid) {
            stream.handle_persistence(persisted_prepare);
        }
    }

    /// Drains buffered messages across streams.
    #[must_use]
    pub fn process_buffered_items(&self) -> ProcessBufferedResult {
        let streams = {
            let guard = Self::lock(&self.streams);
            let mut ordered = guard.iter().map(|(vbid, stream)| (*vbid, Arc::clone(stream)))
                .collect::<Vec<_>>();
            ordered.sort_unstable_by_key(|(vbid, _)| *vbid);
            ordered
        };

        let mut more = false;
        for (_, stream) in streams {
            match stream.process_buffered_messages(PROCESS_BUFFERED_BATCH_LIMIT) {
                ProcessBufferedResult::CannotProcess => {
                    return ProcessBufferedResult::CannotProcess;
                }
                ProcessBufferedResult::MoreToProcess => more = true,
                ProcessBufferedResult::AllProcessed => {}
            }
        }
        if more {
            ProcessBufferedResult::MoreToProcess
        } else {
            ProcessBufferedResult::AllProcessed
        }
    }

    /// Handles a response frame from the producer.
    ///
    /// Returns whether the response was consumed without failing the connection.
    pub fn handle_response(&self, frame: &DcpFrame) -> bool {
        if frame.opcode == Opcode::GetErrorMap {
            *Self::lock(&self.get_error_map_state) = GetErrorMapState::Skip;
            let success = Status::from_u16(frame.vbucket_or_status) == Some(Status::Success);
            self.producer_is_version5_or_higher
                .store(success, Ordering::Release);
            return true;
        }
        true
    }

    /// Emits the next negotiation or acknowledgement message onto the sink.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is ready (the connection parks); `Disconnect` when the
    /// connection has been flagged, including by an earlier fail-new-data escalation.
    pub fn step(&self, sink: &mut dyn MessageSink) -> DcpResult<()> {
        if self.do_disconnect() || self.pending_disconnect.load(Ordering::Acquire) {
            return Err(DcpError::Disconnect("connection flagged for disconnect"));
        }

        // Flow-control window advertisement rides first.
        if !self.flow_control_negotiated.load(Ordering::Acquire) {
            self.flow_control_negotiated.store(true, Ordering::Release);
            let flow = Self::lock(&self.flow_control);
            if flow.is_enabled() {
                let size = flow.buffer_size();
                drop(flow);
                sink.send(&DcpResponse::Control {
                    key: "connection_buffer_size".to_owned(),
                    value: size.to_string(),
                })?;
                return Ok(());
            }
        }

        // GetErrorMap negotiation, only when noop is configured on.
        {
            let mut state = Self::lock(&self.get_error_map_state);
            if *state == GetErrorMapState::PendingRequest {
                if self.bucket.config().dcp_enable_noop {
                    *state = GetErrorMapState::PendingResponse;
                    drop(state);
                    sink.send(&DcpResponse::GetErrorMap { version: 1 })?;
                    return Ok(());
                }
                *state = GetErrorMapState::Skip;
            }
        }

        if let Some(control) = Self::lock(&self.pending_controls).pop_front() {
            sink.send(&control)?;
            return Ok(());
        }

        // Drain per-stream ready queues (handshakes and seqno acks), lowest vBucket first.
        let streams = {
            let guard = Self::lock(&self.streams);
            let mut ordered = guard.iter().map(|(vbid, stream)| (*vbid, Arc::clone(stream)))
                .collect::<Vec<_>>();
            ordered.sort_unstable_by_key(|(vbid, _)| *vbid);
            ordered
        };
        for (_, stream) in streams {
            if let Some(response) = stream.pop_ready() {
                sink.send(&response)?;
                self.paused.store(false, Ordering::Release);
                return Ok(());
            }
        }

        if let Some(bytes) = Self::lock(&self.flow_control).take_pending_ack() {
            sink.send(&DcpResponse::BufferAck { bytes })?;
            return Ok(());
        }

        self.paused.store(true, Ordering::Release);
        Err(DcpError::WouldBlock)
    }

    /// Tears down every stream (connection reaping).
    pub fn close_all_streams(&self) {
        let streams = Self::lock(&self.streams);
        for stream in streams.values() {
            stream.close();
        }
    }

    /// Emits connection stats through the visitor.
    ///
    /// Safe to call after disconnect: reads only connection-owned state.
    pub fn add_stats(&self, visitor: &mut dyn FnMut(&str, String)) {
        visitor("name", self.name.clone());
        visitor("type", "consumer".to_owned());
        visitor("paused", self.is_paused().to_string());
        visitor("disconnect", self.do_disconnect().to_string());
        visitor(
            "sync_replication",
            self.sync_replication.load(Ordering::Acquire).to_string(),
        );
        visitor(
            "num_streams",
            Self::lock(&self.streams).len().to_string(),
        );
        visitor(
            "unacked_bytes",
            Self::lock(&self.flow_control).unacked_bytes().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{DcpConsumer, GetErrorMapState};
    use crate::producer::MessageSink;
    use crate::response::DcpResponse;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use tide_common::config::{EngineConfig, FlowControlPolicyKind};
    use tide_common::error::{DcpError, DcpResult};
    use tide_proto::codec::DcpFrame;
    use tide_proto::message::{Opcode, Status};
    use tide_storage::bucket::KvBucket;
    use tide_storage::vbucket::VbState;

    #[derive(Default)]
    struct RecordingSink {
        sent: Vec<DcpResponse>,
    }

    impl MessageSink for RecordingSink {
        fn send(&mut self, message: &DcpResponse) -> DcpResult<()> {
            self.sent.push(message.clone());
            Ok(())
        }
    }

    fn bucket_with(config: EngineConfig) -> Arc<KvBucket> {
        let bucket = Arc::new(KvBucket::new(config));
        bucket.set_vb_state(0, VbState::Replica);
        bucket
    }

    fn get_error_map_response(status: Status) -> DcpFrame {
        DcpFrame::response(Opcode::GetErrorMap, status as u16, 0)
    }

    #[rstest]
    #[case(Status::Success, true)]
    #[case(Status::UnknownCommand, false)]
    fn get_error_map_negotiation_tracks_producer_version(
        #[case] status: Status,
        #[case] expect_v5: bool,
    ) {
        let config = EngineConfig {
            dcp_enable_noop: true,
            ..EngineConfig::default()
        };
        let consumer = DcpConsumer::new(bucket_with(config), 1, "test_consumer".to_owned());
        assert_that!(
            consumer.get_error_map_state(),
            eq(GetErrorMapState::PendingRequest)
        );
        assert_that!(consumer.producer_is_version5_or_higher(), eq(false));

        let mut sink = RecordingSink::default();
        // Flow-control negotiation consumes the first step when a policy is active.
        consumer.step(&mut sink).expect("flow control step");
        consumer.step(&mut sink).expect("get error map step");
        assert_that!(
            consumer.get_error_map_state(),
            eq(GetErrorMapState::PendingResponse)
        );
        assert_that!(
            matches!(sink.sent.last(), Some(DcpResponse::GetErrorMap { .. })),
            eq(true)
        );

        assert_that!(
            consumer.handle_response(&get_error_map_response(status)),
            eq(true)
        );
        assert_that!(consumer.get_error_map_state(), eq(GetErrorMapState::Skip));
        assert_that!(consumer.producer_is_version5_or_higher(), eq(expect_v5));
    }

    #[rstest]
    fn add_stream_requires_a_replica_vbucket() {
        let bucket = Arc::new(KvBucket::new(EngineConfig::default()));
        bucket.set_vb_state(0, VbState::Active);
        let consumer = DcpConsumer::new(bucket, 1, "test_consumer".to_owned());

        let error = consumer
            .add_stream(0, 0, 0)
            .expect_err("active vbucket refuses a passive stream");
        assert_that!(matches!(error, DcpError::NotSupported(_)), eq(true));
    }

    #[rstest]
    fn add_stream_replaces_only_dead_streams() {
        let consumer = DcpConsumer::new(
            bucket_with(EngineConfig::default()),
            1,
            "test_consumer".to_owned(),
        );
        consumer.add_stream(0, 0, 0).expect("first stream");
        assert_that!(consumer.add_stream(0, 0, 0).is_err(), eq(true));

        let stream = consumer.get_vbucket_stream(0).expect("stream exists");
        stream.close();
        consumer.add_stream(0, 0, 0).expect("dead stream replaced");
        let replacement = consumer.get_vbucket_stream(0).expect("stream exists");
        assert_that!(replacement.is_active(), eq(true));
    }

    #[rstest]
    fn every_receipt_advances_last_message_time_strictly() {
        let consumer = DcpConsumer::new(
            bucket_with(EngineConfig::default()),
            1,
            "test_consumer".to_owned(),
        );
        consumer.add_stream(0, 0, 0).expect("stream added");
        consumer
            .snapshot_marker(1, 0, 1, 10, tide_proto::message::MarkerFlags::MEMORY)
            .expect("marker");
        let after_marker = consumer.last_message_time();
        assert_that!(after_marker > 0, eq(true));

        consumer
            .mutation(1, 0, b"key".to_vec(), b"value".to_vec(), 0, 0, 1, 1, Vec::new())
            .expect("mutation");
        assert_that!(consumer.last_message_time() > after_marker, eq(true));
    }

    #[rstest]
    fn negotiation_ladder_orders_flow_control_before_error_map() {
        let config = EngineConfig {
            dcp_enable_noop: true,
            dcp_flow_control_policy: FlowControlPolicyKind::Static,
            ..EngineConfig::default()
        };
        let consumer = DcpConsumer::new(bucket_with(config), 1, "test_consumer".to_owned());
        let mut sink = RecordingSink::default();

        consumer.step(&mut sink).expect("step");
        consumer.step(&mut sink).expect("step");
        consumer.step(&mut sink).expect("step");

        let DcpResponse::Control { key, .. } = &sink.sent[0] else {
            panic!("expected flow-control advertisement first");
        };
        assert_that!(key.as_str(), eq("connection_buffer_size"));
        assert_that!(
            matches!(&sink.sent[1], DcpResponse::GetErrorMap { .. }),
            eq(true)
        );
        let DcpResponse::Control { key, .. } = &sink.sent[2] else {
            panic!("expected noop negotiation after error map");
        };
        assert_that!(key.as_str(), eq("enable_noop"));
    }
}
