//! Producer connection: stream ownership, control negotiation, and the step loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use tracing::{debug, warn};

use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Cookie, Opaque, Seqno, VbUuid, Vbid};
use tide_proto::message::{OpenFlags, StreamEndReason};
use tide_proto::value::TransportPolicy;
use tide_storage::bucket::KvBucket;
use tide_storage::failover::{FailoverEntry, HistoryResolution};

use crate::active_stream::{ActiveStream, ActiveStreamState};
use crate::backfill::{BackfillManager, BackfillRunResult};
use crate::flow_control::BufferLog;
use crate::response::DcpResponse;

/// Opaque reserved for producer noop traffic, distinct from any stream opaque.
pub const NOOP_OPAQUE: Opaque = 0xFFFF_FFFF;

/// Items pulled from a checkpoint cursor per processor pass.
pub const SNAPSHOT_BATCH_LIMIT: usize = 500;

/// Sink the step loop writes responses into (the socket writer, or a test recorder).
pub trait MessageSink {
    /// Accepts one response for transmission.
    fn send(&mut self, message: &DcpResponse) -> DcpResult<()>;
}

/// Connection priority negotiated via `set_priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPriority {
    /// Low scheduling priority.
    Low,
    /// Default scheduling priority.
    #[default]
    Medium,
    /// High scheduling priority.
    High,
}

/// Outcome of a keepalive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoopOutcome {
    /// A noop went onto the wire.
    Sent,
    /// The send interval has not elapsed.
    NotDue,
    /// Noop is not negotiated on this connection.
    Disabled,
}

/// Outcome of an idle-timeout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDecision {
    /// The connection exceeded the idle timeout and is flagged for disconnect.
    Disconnect,
    /// The connection is healthy.
    NoAction,
}

/// Outcome of a stream request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequestOutcome {
    /// The stream was created; the failover log rides back to the client.
    Accepted {
        /// Failover entries, newest first.
        failover: Vec<FailoverEntry>,
    },
    /// The client must roll back and retry.
    Rollback {
        /// Seqno to roll back to.
        rollback_seqno: Seqno,
    },
}

#[derive(Debug)]
struct ProducerControls {
    noop_enabled: bool,
    noop_interval_secs: u64,
    send_stream_end_on_client_close: bool,
    force_value_compression: bool,
    priority: ConnectionPriority,
    sync_replication: bool,
    cursor_dropping: bool,
}

#[derive(Debug)]
struct NoopState {
    pending_recv: bool,
    send_time_secs: u64,
}

/// Seconds-resolution wall clock used for noop pacing.
#[must_use]
pub fn current_time_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Producer side of one DCP connection.
#[derive(Debug)]
pub struct DcpProducer {
    name: String,
    cookie: Cookie,
    flags: OpenFlags,
    notifier: bool,
    bucket: Arc<KvBucket>,
    streams: Mutex<HashMap<Vbid, ActiveStream>>,
    controls: Mutex<ProducerControls>,
    buffer_log: Mutex<BufferLog>,
    noop: Mutex<NoopState>,
    backfills: BackfillManager,
    paused: AtomicBool,
    disconnect_requested: AtomicBool,
    snappy_enabled: AtomicBool,
    last_receive_time_secs: AtomicU64,
}

impl DcpProducer {
    /// Creates a producer connection.
    #[must_use]
    pub fn new(bucket: Arc<KvBucket>, cookie: Cookie, name: String, flags: OpenFlags) -> Self {
        let config = bucket.config();
        let controls = ProducerControls {
            noop_enabled: false,
            noop_interval_secs: config.dcp_noop_tx_interval_secs,
            send_stream_end_on_client_close: false,
            force_value_compression: false,
            priority: ConnectionPriority::default(),
            sync_replication: false,
            cursor_dropping: false,
        };
        Self {
            name,
            cookie,
            flags,
            notifier: flags.contains(OpenFlags::NOTIFIER),
            bucket,
            streams: Mutex::new(HashMap::new()),
            controls: Mutex::new(controls),
            buffer_log: Mutex::new(BufferLog::new()),
            noop: Mutex::new(NoopState {
                pending_recv: false,
                send_time_secs: current_time_secs(),
            }),
            backfills: BackfillManager::new(),
            paused: AtomicBool::new(true),
            disconnect_requested: AtomicBool::new(false),
            snappy_enabled: AtomicBool::new(false),
            last_receive_time_secs: AtomicU64::new(current_time_secs()),
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

    /// Whether this connection was opened as a notifier.
    #[must_use]
    pub fn is_notifier(&self) -> bool {
        self.notifier
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

    /// Marks Snappy as negotiated on the transport.
    pub fn set_snappy_enabled(&self, enabled: bool) {
        self.snappy_enabled.store(enabled, Ordering::Release);
    }

    /// Records traffic from the client.
    pub fn record_receive(&self) {
        self.last_receive_time_secs
            .store(current_time_secs(), Ordering::Release);
    }

    /// Handles a control option from the client.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::InvalidArgument` for unknown keys and malformed or out-of-contract
    /// values; no stream is terminated.
    pub fn control(&self, key: &str, value: &str) -> DcpResult<()> {
        match key {
            "enable_noop" => {
                Self::lock(&self.controls).noop_enabled = parse_bool(key, value)?;
                Ok(())
            }
            "set_noop_interval" => {
                let interval = value.parse::<u64>().map_err(|_| {
                    DcpError::InvalidArgument(format!("noop interval '{value}' is not seconds"))
                })?;
                let manager_interval = self
                    .bucket
                    .config()
                    .connection_manager_interval_secs
                    .max(1);
                if interval == 0 || interval % manager_interval != 0 {
                    return Err(DcpError::InvalidArgument(format!(
                        "noop interval {interval} must be a multiple of the connection manager \
                         interval {manager_interval}"
                    )));
                }
                Self::lock(&self.controls).noop_interval_secs = interval;
                Ok(())
            }
            "send_stream_end_on_client_close_stream" => {
                Self::lock(&self.controls).send_stream_end_on_client_close =
                    parse_bool(key, value)?;
                Ok(())
            }
            "force_value_compression" => {
                Self::lock(&self.controls).force_value_compression = parse_bool(key, value)?;
                Ok(())
            }
            "set_priority" => {
                let priority = match value {
                    "low" => ConnectionPriority::Low,
                    "medium" => ConnectionPriority::Medium,
                    "high" => ConnectionPriority::High,
                    _ => {
                        return Err(DcpError::InvalidArgument(format!(
                            "unknown priority '{value}'"
                        )));
                    }
                };
                Self::lock(&self.controls).priority = priority;
                Ok(())
            }
            "supports_cursor_dropping" => {
                Self::lock(&self.controls).cursor_dropping = parse_bool(key, value)?;
                Ok(())
            }
            "enable_sync_replication" => {
                Self::lock(&self.controls).sync_replication = parse_bool(key, value)?;
                Ok(())
            }
            "connection_buffer_size" => {
                let bytes = value.parse::<usize>().map_err(|_| {
                    DcpError::InvalidArgument(format!("buffer size '{value}' is not bytes"))
                })?;
                Self::lock(&self.buffer_log).set_buffer_size(bytes);
                Ok(())
            }
            _ => Err(DcpError::InvalidArgument(format!(
                "unknown control key '{key}'"
            ))),
        }
    }

    /// Negotiated priority (stats visibility).
    #[must_use]
    pub fn priority(&self) -> ConnectionPriority {
        Self::lock(&self.controls).priority
    }

    fn cursor_name_for(&self, vbid: Vbid) -> String {
        format!("dcp:{}:vb:{vbid}", self.name)
    }

    /// Resolves a stream request into a live stream, a rollback, or a failure.
    #[allow(clippy::too_many_arguments)]
    pub fn stream_request(
        &self,
        flags: u32,
        opaque: Opaque,
        vbid: Vbid,
        start_seqno: Seqno,
        end_seqno: Seqno,
        vb_uuid: VbUuid,
        snap_start_seqno: Seqno,
        snap_end_seqno: Seqno,
    ) -> DcpResult<StreamRequestOutcome> {
        self.record_receive();
        let vbucket = self.bucket.require_vbucket(vbid)?;
        // Lock order is streams before vbucket, as in every other producer path.
        let mut streams = Self::lock(&self.streams);
        let mut vb = vbucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if vb.is_receiving_disk_snapshot() {
            return Err(DcpError::TempFail("vbucket is receiving a disk snapshot"));
        }
        if let Some(existing) = streams.get(&vbid) {
            if existing.state() != ActiveStreamState::Dead {
                return Err(DcpError::Failed("stream already exists for vbucket"));
            }
            vb.checkpoints.deregister_cursor(existing.cursor_name());
            let _ = streams.remove(&vbid);
        }

        match vb
            .failover
            .resolve(start_seqno, vb_uuid, snap_start_seqno, snap_end_seqno)
        {
            HistoryResolution::Rollback(rollback_seqno) => {
                return Ok(StreamRequestOutcome::Rollback { rollback_seqno });
            }
            HistoryResolution::Accept => {}
        }

        let controls = Self::lock(&self.controls);
        let include_xattrs = self.flags.contains(OpenFlags::INCLUDE_XATTRS);
        let no_value = self.flags.contains(OpenFlags::NO_VALUE);
        let policy = TransportPolicy {
            consumer_supports_snappy: self.snappy_enabled.load(Ordering::Acquire),
            xattrs_only: include_xattrs && no_value,
            force_value_compression: controls.force_value_compression,
        };
        drop(controls);

        let cursor_name = self.cursor_name_for(vbid);
        let mut stream = ActiveStream::new(
            vbid,
            opaque,
            flags,
            start_seqno,
            end_seqno,
            vb_uuid,
            snap_start_seqno,
            snap_end_seqno,
            cursor_name.clone(),
            policy,
            no_value && !include_xattrs,
        );

        if vb.checkpoints.covers_start_seqno(start_seqno) {
            vb.checkpoints.register_cursor(&cursor_name, start_seqno)?;
            stream.mark_in_memory()?;
        } else {
            stream.mark_backfilling()?;
            self.backfills
                .schedule(vbid, start_seqno + 1, vb.persisted_seqno());
        }

        debug!(
            connection = %self.name,
            vbid,
            start_seqno,
            state = ?stream.state(),
            "stream request accepted"
        );
        let failover = vb.failover.entries().to_vec();
        streams.insert(vbid, stream);
        Ok(StreamRequestOutcome::Accepted { failover })
    }

    /// Returns the failover log for one vBucket.
    pub fn get_failover_log(&self, vbid: Vbid) -> DcpResult<Vec<FailoverEntry>> {
        let vbucket = self.bucket.require_vbucket(vbid)?;
        let vb = vbucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(vb.failover.entries().to_vec())
    }

    /// Returns the state of the stream for `vbid`, when one exists.
    #[must_use]
    pub fn stream_state(&self, vbid: Vbid) -> Option<ActiveStreamState> {
        Self::lock(&self.streams).get(&vbid).map(ActiveStream::state)
    }

    /// Returns whether a live (non-dead) stream exists for `vbid`.
    #[must_use]
    pub fn has_live_stream(&self, vbid: Vbid) -> bool {
        Self::lock(&self.streams)
            .get(&vbid)
            .is_some_and(|stream| stream.state() != ActiveStreamState::Dead)
    }

    /// Closes the stream for `vbid`.
    ///
    /// With `send_stream_end_on_client_close_stream` negotiated the stream still emits a
    /// stream-end carrying `Closed`; otherwise it is removed synchronously.
    pub fn close_stream(&self, _opaque: Opaque, vbid: Vbid) -> DcpResult<()> {
        self.record_receive();
        let send_end = Self::lock(&self.controls).send_stream_end_on_client_close;
        let mut streams = Self::lock(&self.streams);
        let Some(stream) = streams.get_mut(&vbid) else {
            return Err(DcpError::NotSupported("no stream for vbucket"));
        };

        stream.close(StreamEndReason::Closed, send_end);
        if !send_end {
            let cursor_name = stream.cursor_name().to_owned();
            let _ = streams.remove(&vbid);
            drop(streams);
            self.deregister_cursor(vbid, &cursor_name);
        }
        Ok(())
    }

    fn deregister_cursor(&self, vbid: Vbid, cursor_name: &str) {
        if let Some(vbucket) = self.bucket.get_vbucket(vbid) {
            vbucket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .checkpoints
                .deregister_cursor(cursor_name);
        }
    }

    /// Tears down every stream (connection reaping).
    pub fn close_all_streams(&self) {
        let mut streams = Self::lock(&self.streams);
        let drained = streams.drain().collect::<Vec<_>>();
        drop(streams);
        for (vbid, stream) in drained {
            self.deregister_cursor(vbid, stream.cursor_name());
        }
    }

    /// Runs one pass of the checkpoint snapshot processor for this connection.
    ///
    /// Drains each in-memory stream's cursor in bounded batches into its ready queue.
    /// Returns whether any stream produced new responses.
    pub fn run_snapshot_processor(&self) -> DcpResult<bool> {
        let mut produced = false;
        let mut streams = Self::lock(&self.streams);
        for (vbid, stream) in streams.iter_mut() {
            if stream.state() != ActiveStreamState::InMemory {
                continue;
            }
            let Some(vbucket) = self.bucket.get_vbucket(*vbid) else {
                continue;
            };
            let entries = {
                let mut vb = vbucket
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                vb.checkpoints
                    .drain_cursor(stream.cursor_name(), SNAPSHOT_BATCH_LIMIT)
            };
            let has_items = entries
                .iter()
                .any(|entry| matches!(entry, tide_storage::checkpoint::CursorEntry::Item(_)));
            if has_items {
                stream.process_cursor_entries(entries)?;
                produced = true;
            } else if stream.is_takeover() && !stream.items_ready() {
                stream.begin_takeover()?;
                produced = true;
            }
        }
        Ok(produced)
    }

    /// Runs scheduled backfills, yielding between bounded batches.
    ///
    /// A scan that overruns its stream's ready-queue budget is requeued and the pass returns,
    /// to be rescheduled once the writer drains.
    pub fn run_backfills(&self) -> DcpResult<()> {
        while let Some(mut backfill) = self.backfills.take_next() {
            let vbid = backfill.vbid();
            let vbucket = self.bucket.require_vbucket(vbid)?;
            let mut streams = Self::lock(&self.streams);
            let Some(stream) = streams.get_mut(&vbid) else {
                continue;
            };

            let outcome = loop {
                let result = {
                    let vb = vbucket
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    backfill.run(&vb, stream)?
                };
                if result != BackfillRunResult::Yielded {
                    break result;
                }
            };

            match outcome {
                BackfillRunResult::Paused => {
                    drop(streams);
                    self.backfills.requeue(backfill);
                    return Ok(());
                }
                BackfillRunResult::Complete { resume_seqno } => {
                    let cursor_name = stream.cursor_name().to_owned();
                    vbucket
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .checkpoints
                        .register_cursor(&cursor_name, resume_seqno)?;
                    stream.complete_backfill()?;
                }
                BackfillRunResult::Yielded => {}
            }
        }
        Ok(())
    }

    /// Sends a keepalive when one is due.
    ///
    /// A sink failure (for example message-too-big) leaves the noop state untouched.
    pub fn maybe_send_noop(&self, sink: &mut dyn MessageSink) -> DcpResult<NoopOutcome> {
        let controls = Self::lock(&self.controls);
        if !controls.noop_enabled {
            return Ok(NoopOutcome::Disabled);
        }
        let interval = controls.noop_interval_secs;
        drop(controls);

        let mut noop = Self::lock(&self.noop);
        let now = current_time_secs();
        if now.wrapping_sub(noop.send_time_secs) < interval {
            return Ok(NoopOutcome::NotDue);
        }
        sink.send(&DcpResponse::Noop {
            opaque: NOOP_OPAQUE,
        })?;
        noop.pending_recv = true;
        noop.send_time_secs = now;
        Ok(NoopOutcome::Sent)
    }

    /// Handles the client's noop response.
    pub fn handle_noop_response(&self) {
        self.record_receive();
        Self::lock(&self.noop).pending_recv = false;
    }

    /// Handles a response frame from the consumer.
    ///
    /// Stream-end, marker, and state acknowledgements are absorbed without failing the
    /// connection; a noop response clears the pending flag.
    pub fn handle_response(&self, frame: &tide_proto::codec::DcpFrame) -> bool {
        match frame.opcode {
            tide_proto::message::Opcode::Noop => {
                self.handle_noop_response();
                true
            }
            tide_proto::message::Opcode::SetVbucketState => {
                let mut streams = Self::lock(&self.streams);
                if let Some(stream) = streams
                    .values_mut()
                    .find(|stream| stream.opaque() == frame.opaque)
                {
                    let _ = stream.handle_takeover_ack();
                }
                true
            }
            _ => true,
        }
    }

    /// Decides whether an unanswered noop has exceeded the idle timeout.
    pub fn maybe_disconnect(&self) -> DisconnectDecision {
        let pending = Self::lock(&self.noop).pending_recv;
        if !pending {
            return DisconnectDecision::NoAction;
        }
        let idle_timeout = self.bucket.config().dcp_idle_timeout_secs;
        let last_receive = self.last_receive_time_secs.load(Ordering::Acquire);
        if current_time_secs().saturating_sub(last_receive) > idle_timeout {
            warn!(connection = %self.name, "idle timeout with unanswered noop");
            self.flag_disconnect();
            return DisconnectDecision::Disconnect;
        }
        DisconnectDecision::NoAction
    }

    /// Applies a buffer acknowledgement from the consumer.
    pub fn handle_buffer_ack(&self, bytes: u32) {
        self.record_receive();
        Self::lock(&self.buffer_log).ack(bytes as usize);
        self.paused.store(false, Ordering::Release);
    }

    /// Applies the consumer's acknowledgement of a takeover state handoff.
    pub fn handle_set_vbucket_state_response(&self, vbid: Vbid) -> DcpResult<()> {
        self.record_receive();
        let mut streams = Self::lock(&self.streams);
        let Some(stream) = streams.get_mut(&vbid) else {
            return Err(DcpError::NotSupported("no stream for vbucket"));
        };
        stream.handle_takeover_ack()
    }

    /// Emits the next response onto the sink.
    ///
    /// # Errors
    ///
    /// `WouldBlock` when nothing is ready or the consumer's window is exhausted (the
    /// connection parks); `Disconnect` when the connection has been flagged for teardown.
    pub fn step(&self, sink: &mut dyn MessageSink) -> DcpResult<()> {
        if self.do_disconnect() {
            return Err(DcpError::Disconnect("connection flagged for disconnect"));
        }

        match self.maybe_send_noop(sink) {
            Ok(NoopOutcome::Sent) => {
                self.paused.store(false, Ordering::Release);
                return Ok(());
            }
            Ok(NoopOutcome::NotDue | NoopOutcome::Disabled) => {}
            Err(error) => return Err(error),
        }

        let mut streams = Self::lock(&self.streams);
        let mut vbids = streams.keys().copied().collect::<Vec<_>>();
        vbids.sort_unstable();

        for vbid in vbids {
            let Some(stream) = streams.get_mut(&vbid) else {
                continue;
            };
            let Some(size) = stream.next_response_size() else {
                if stream.is_drained_dead() {
                    let cursor_name = stream.cursor_name().to_owned();
                    let _ = streams.remove(&vbid);
                    self.deregister_cursor(vbid, &cursor_name);
                }
                continue;
            };

            let mut buffer_log = Self::lock(&self.buffer_log);
            if buffer_log.would_overrun(size) {
                drop(buffer_log);
                self.paused.store(true, Ordering::Release);
                return Err(DcpError::WouldBlock);
            }

            let response = stream
                .next_response()
                .expect("sized response must be poppable");
            buffer_log.record_sent(size);
            drop(buffer_log);

            sink.send(&response)?;
            if stream.is_drained_dead() {
                let cursor_name = stream.cursor_name().to_owned();
                let _ = streams.remove(&vbid);
                self.deregister_cursor(vbid, &cursor_name);
            }
            self.paused.store(false, Ordering::Release);
            return Ok(());
        }

        self.paused.store(true, Ordering::Release);
        Err(DcpError::WouldBlock)
    }

    /// Emits connection stats through the visitor.
    ///
    /// Safe to call after disconnect: reads only connection-owned state.
    pub fn add_stats(&self, visitor: &mut dyn FnMut(&str, String)) {
        visitor("name", self.name.clone());
        let conn_type = if self.notifier { "notifier" } else { "producer" };
        visitor("type", conn_type.to_owned());
        visitor("paused", self.is_paused().to_string());
        visitor("disconnect", self.do_disconnect().to_string());
        let controls = Self::lock(&self.controls);
        visitor("noop_enabled", controls.noop_enabled.to_string());
        visitor("noop_interval", controls.noop_interval_secs.to_string());
        visitor(
            "cursor_dropping",
            controls.cursor_dropping.to_string(),
        );
        visitor(
            "sync_replication",
            controls.sync_replication.to_string(),
        );
        drop(controls);
        visitor(
            "num_streams",
            Self::lock(&self.streams).len().to_string(),
        );
        visitor(
            "unacked_bytes",
            Self::lock(&self.buffer_log).bytes_outstanding().to_string(),
        );
    }

    /// Test hook: places the last noop send time.
    pub fn set_noop_send_time(&self, send_time_secs: u64) {
        Self::lock(&self.noop).send_time_secs = send_time_secs;
    }

    /// Test hook: toggles noop without the control round-trip.
    pub fn set_noop_enabled(&self, enabled: bool) {
        Self::lock(&self.controls).noop_enabled = enabled;
    }

    /// Whether a noop is awaiting its response.
    #[must_use]
    pub fn noop_pending_recv(&self) -> bool {
        Self::lock(&self.noop).pending_recv
    }

    /// Last noop send time (test visibility).
    #[must_use]
    pub fn noop_send_time(&self) -> u64 {
        Self::lock(&self.noop).send_time_secs
    }

    /// Test hook: places the last receive time.
    pub fn set_last_receive_time(&self, secs: u64) {
        self.last_receive_time_secs.store(secs, Ordering::Release);
    }
}

fn parse_bool(key: &str, value: &str) -> DcpResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DcpError::InvalidArgument(format!(
            "control '{key}' expects a boolean, got '{value}'"
        ))),
    }
}
