use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tide_common::config::EngineConfig;
use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{Cookie, Vbid};
use tide_proto::message::OpenFlags;
use tide_storage::bucket::KvBucket;
use tide_storage::item::Item;
use tide_storage::vbucket::VbState;

use crate::connmap::CookieHost;
use crate::producer::MessageSink;
use crate::response::DcpResponse;

pub(super) fn producer_flags() -> OpenFlags {
    OpenFlags(OpenFlags::PRODUCER)
}

/// Sink that records everything the connection emits.
#[derive(Default)]
pub(super) struct RecordingSink {
    pub sent: Vec<DcpResponse>,
}

impl MessageSink for RecordingSink {
    fn send(&mut self, message: &DcpResponse) -> DcpResult<()> {
        self.sent.push(message.clone());
        Ok(())
    }
}

/// Sink whose wire refuses noops with message-too-big.
#[derive(Default)]
pub(super) struct TooBigNoopSink;

impl MessageSink for TooBigNoopSink {
    fn send(&mut self, message: &DcpResponse) -> DcpResult<()> {
        if matches!(message, DcpResponse::Noop { .. }) {
            return Err(DcpError::TooBig);
        }
        Ok(())
    }
}

/// Host surface that counts io-complete notifications per process.
#[derive(Debug, Default)]
pub(super) struct CountingCookieHost {
    notifications: AtomicUsize,
}

impl CountingCookieHost {
    pub(super) fn notify_count(&self) -> usize {
        self.notifications.load(Ordering::Acquire)
    }
}

impl CookieHost for CountingCookieHost {
    fn notify_io_complete(&self, _cookie: Cookie, _status: DcpResult<()>) {
        let _ = self.notifications.fetch_add(1, Ordering::AcqRel);
    }
}

pub(super) fn bucket_with_vbucket(config: EngineConfig, state: VbState) -> Arc<KvBucket> {
    let bucket = Arc::new(KvBucket::new(config));
    bucket.set_vb_state(0, state);
    bucket
}

/// Stores `count` sequenced items into an active vBucket and returns its uuid.
pub(super) fn seed_active_items(bucket: &Arc<KvBucket>, vbid: Vbid, count: u64) -> u64 {
    let vbucket = bucket.get_vbucket(vbid).expect("vbucket exists");
    let mut guard = vbucket.lock().expect("vbucket lock");
    for seqno in 1..=count {
        guard
            .store(Item::mutation(
                vbid,
                format!("key-{seqno}").into_bytes(),
                format!("value-{seqno}").into_bytes(),
            ))
            .expect("store succeeds");
    }
    guard.uuid()
}

pub(super) fn vbucket_uuid(bucket: &Arc<KvBucket>, vbid: Vbid) -> u64 {
    bucket
        .get_vbucket(vbid)
        .expect("vbucket exists")
        .lock()
        .expect("vbucket lock")
        .uuid()
}

/// Steps a producer until it parks, returning everything it emitted.
pub(super) fn drain_producer(
    producer: &crate::producer::DcpProducer,
) -> Vec<DcpResponse> {
    let mut sink = RecordingSink::default();
    loop {
        match producer.step(&mut sink) {
            Ok(()) => {}
            Err(DcpError::WouldBlock) => break,
            Err(error) => panic!("unexpected step error: {error}"),
        }
    }
    sink.sent
}

/// Steps a consumer until it parks, returning everything it emitted.
pub(super) fn drain_consumer(
    consumer: &crate::consumer::DcpConsumer,
) -> Vec<DcpResponse> {
    let mut sink = RecordingSink::default();
    loop {
        match consumer.step(&mut sink) {
            Ok(()) => {}
            Err(DcpError::WouldBlock) => break,
            Err(error) => panic!("unexpected step error: {error}"),
        }
    }
    sink.sent
}
