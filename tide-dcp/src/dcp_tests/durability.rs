use googletest::prelude::*;
use rstest::rstest;
use std::sync::Arc;

use tide_common::config::EngineConfig;
use tide_proto::message::MarkerFlags;
use tide_storage::item::DurabilityRequirement;
use tide_storage::vbucket::VbState;

use super::testkit::bucket_with_vbucket;
use crate::connmap::{DcpConnMap, NullCookieHost};
use crate::response::DcpResponse;

#[rstest]
fn prepare_receipt_queues_one_memory_ack_for_the_snapshot() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.enable_sync_replication();
    consumer.add_stream(0, 0, 0).expect("stream added");

    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    // The handshake message sits in the ready queue first.
    assert_that!(stream.ready_queue_len(), eq(1_usize));
    assert_that!(
        matches!(
            stream.front_ready().expect("handshake"),
            DcpResponse::StreamReq { .. }
        ),
        eq(true)
    );
    let _ = stream.pop_ready();

    consumer
        .snapshot_marker(0, 0, 1, 3, MarkerFlags::MEMORY)
        .expect("marker applies");
    assert_that!(stream.ready_queue_len(), eq(0_usize));

    consumer
        .mutation(0, 0, b"key-1".to_vec(), b"value".to_vec(), 0, 0, 1, 0, Vec::new())
        .expect("seqno 1 applies");
    assert_that!(stream.ready_queue_len(), eq(0_usize));

    consumer
        .prepare(
            0,
            0,
            b"key-2".to_vec(),
            b"value".to_vec(),
            2,
            0,
            DurabilityRequirement::default(),
        )
        .expect("seqno 2 applies");
    assert_that!(stream.ready_queue_len(), eq(1_usize));
    let DcpResponse::SeqnoAck(ack) = stream.front_ready().expect("ack queued") else {
        panic!("expected a seqno ack");
    };
    assert_that!(ack.in_memory_seqno(), eq(2_u64.to_be()));
    assert_that!(ack.on_disk_seqno(), eq(0_u64));

    // The snapshot-end mutation must not add a second ack.
    consumer
        .mutation(0, 0, b"key-3".to_vec(), b"value".to_vec(), 0, 0, 3, 0, Vec::new())
        .expect("seqno 3 applies");
    assert_that!(stream.ready_queue_len(), eq(1_usize));
}

#[rstest]
fn flush_of_a_partial_snapshot_acks_the_persisted_prepare() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.enable_sync_replication();
    consumer.add_stream(0, 0, 0).expect("stream added");
    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    let _ = stream.pop_ready();

    // Snapshot [1, 4]: seqno 4 never arrives, so the flush covers a partial snapshot.
    consumer
        .snapshot_marker(0, 0, 1, 4, MarkerFlags::MEMORY)
        .expect("marker applies");
    consumer
        .mutation(0, 0, b"key-1".to_vec(), b"value".to_vec(), 0, 0, 1, 0, Vec::new())
        .expect("seqno 1 applies");
    consumer
        .prepare(
            0,
            0,
            b"key-2".to_vec(),
            b"value".to_vec(),
            2,
            0,
            DurabilityRequirement::default(),
        )
        .expect("seqno 2 applies");

    // Drop the in-memory ack queued at prepare receipt.
    let DcpResponse::SeqnoAck(memory_ack) = stream.pop_ready().expect("memory ack") else {
        panic!("expected the memory ack first");
    };
    assert_that!(memory_ack.in_memory_seqno(), eq(2_u64.to_be()));
    assert_that!(memory_ack.on_disk_seqno(), eq(0_u64));

    consumer
        .mutation(0, 0, b"key-3".to_vec(), b"value".to_vec(), 0, 0, 3, 0, Vec::new())
        .expect("seqno 3 applies");
    assert_that!(stream.ready_queue_len(), eq(0_usize));

    let flush = bucket.flush_vbucket(0).expect("flush persists");
    assert_that!(flush.num_flushed, eq(3_usize));
    consumer.notify_vbucket_persisted(0, flush);

    let DcpResponse::SeqnoAck(disk_ack) = stream.pop_ready().expect("disk ack") else {
        panic!("expected the disk ack");
    };
    assert_that!(disk_ack.in_memory_seqno(), eq(2_u64.to_be()));
    assert_that!(disk_ack.on_disk_seqno(), eq(2_u64.to_be()));
}

#[rstest]
fn without_sync_replication_no_ack_is_attempted() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    let _ = stream.pop_ready();

    consumer
        .snapshot_marker(0, 0, 1, 3, MarkerFlags::MEMORY)
        .expect("marker applies");
    consumer
        .prepare(
            0,
            0,
            b"key-1".to_vec(),
            b"value".to_vec(),
            1,
            0,
            DurabilityRequirement::default(),
        )
        .expect("prepare applies");
    assert_that!(stream.ready_queue_len(), eq(0_usize));

    let flush = bucket.flush_vbucket(0).expect("flush persists");
    consumer.notify_vbucket_persisted(0, flush);
    assert_that!(stream.ready_queue_len(), eq(0_usize));
}
