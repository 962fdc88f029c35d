use googletest::prelude::*;
use rstest::rstest;
use std::sync::Arc;

use tide_common::config::EngineConfig;
use tide_common::error::DcpError;
use tide_proto::message::{MarkerFlags, OpenFlags, StreamEndReason};
use tide_proto::value::{build_xattr_value, deflate, xattr_section_len};
use tide_storage::item::{DATATYPE_JSON, DATATYPE_SNAPPY, DATATYPE_XATTR, Item};
use tide_storage::vbucket::VbState;

use super::testkit::{
    RecordingSink, bucket_with_vbucket, drain_producer, producer_flags, seed_active_items,
};
use crate::active_stream::{ActiveStreamState, STREAM_FLAG_TAKEOVER};
use crate::connmap::{DcpConnMap, NullCookieHost};
use crate::passive_stream::ProcessBufferedResult;
use crate::response::DcpResponse;

/// Checks properties every stream transcript must satisfy: strictly monotonic seqnos, and
/// every document message contained in the preceding marker's range.
fn assert_transcript_is_well_formed(sent: &[DcpResponse]) {
    let mut last_seqno = 0_u64;
    let mut window: Option<(u64, u64)> = None;
    for response in sent {
        match response {
            DcpResponse::SnapshotMarker {
                start_seqno,
                end_seqno,
                ..
            } => window = Some((*start_seqno, *end_seqno)),
            DcpResponse::Mutation(mutation) => {
                let seqno = mutation.item.by_seqno;
                assert_that!(seqno > last_seqno, eq(true));
                last_seqno = seqno;
                let (start, end) = window.expect("mutation outside any snapshot");
                assert_that!(start <= seqno && seqno <= end, eq(true));
            }
            _ => {}
        }
    }
}

#[rstest]
fn in_memory_transcript_honors_marker_containment() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = seed_active_items(&bucket, 0, 5);
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "replication:mem", producer_flags())
        .expect("producer opens");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");

    let _ = producer.run_snapshot_processor().expect("processor pass");
    let sent = drain_producer(&producer);
    assert_transcript_is_well_formed(&sent);
    assert_that!(
        sent.iter().filter_map(DcpResponse::by_seqno).count(),
        eq(5_usize)
    );
}

#[rstest]
fn backfill_covers_reclaimed_history_then_hands_off_to_memory() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = seed_active_items(&bucket, 0, 3);
    let _ = bucket.flush_vbucket(0).expect("flush persists history");
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        let _ = guard.checkpoints.create_checkpoint();
        let reclaimed = guard.checkpoints.remove_closed_unreferenced_checkpoints();
        assert_that!(reclaimed, eq(3_usize));
        assert_that!(guard.checkpoints.covers_start_seqno(0), eq(false));
    }

    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "replication:backfill", producer_flags())
        .expect("producer opens");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");
    assert_that!(
        producer.stream_state(0),
        eq(Some(ActiveStreamState::Backfilling))
    );

    producer.run_backfills().expect("backfill runs");
    assert_that!(
        producer.stream_state(0),
        eq(Some(ActiveStreamState::InMemory))
    );

    let sent = drain_producer(&producer);
    let DcpResponse::SnapshotMarker { flags, .. } = &sent[0] else {
        panic!("expected the disk snapshot marker first");
    };
    assert_that!(*flags, eq(MarkerFlags::DISK));
    assert_transcript_is_well_formed(&sent);

    // New in-memory items continue the same stream past the backfill.
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        guard
            .store(Item::mutation(0, b"key-4".to_vec(), b"value-4".to_vec()))
            .expect("stores");
    }
    let _ = producer.run_snapshot_processor().expect("processor pass");
    let tail = drain_producer(&producer);
    let seqnos = tail
        .iter()
        .filter_map(DcpResponse::by_seqno)
        .collect::<Vec<_>>();
    assert_that!(seqnos, eq(&vec![4_u64]));
}

#[rstest]
fn takeover_stream_finishes_with_a_state_handoff() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = seed_active_items(&bucket, 0, 2);
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "replication:takeover", producer_flags())
        .expect("producer opens");
    let _ = producer
        .stream_request(STREAM_FLAG_TAKEOVER, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");

    // First pass moves the seeded items; the second finds the cursor dry and starts takeover.
    let _ = producer.run_snapshot_processor().expect("processor pass");
    let sent = drain_producer(&producer);
    assert_transcript_is_well_formed(&sent);
    let _ = producer.run_snapshot_processor().expect("processor pass");

    let handoff = drain_producer(&producer);
    assert_that!(
        matches!(handoff[0], DcpResponse::SetVbucketState { .. }),
        eq(true)
    );
    assert_that!(
        producer.stream_state(0),
        eq(Some(ActiveStreamState::TakeoverWait))
    );

    producer
        .handle_set_vbucket_state_response(0)
        .expect("takeover ack lands");
    let tail = drain_producer(&producer);
    let DcpResponse::StreamEnd { reason, .. } = &tail[0] else {
        panic!("expected a stream end after takeover");
    };
    assert_that!(*reason, eq(StreamEndReason::StateChanged));
    assert_that!(producer.has_live_stream(0), eq(false));
}

#[rstest]
fn exhausted_flow_control_window_parks_the_producer() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = seed_active_items(&bucket, 0, 2);
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "replication:window", producer_flags())
        .expect("producer opens");
    producer
        .control("connection_buffer_size", "100")
        .expect("window advertised");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");
    let _ = producer.run_snapshot_processor().expect("processor pass");

    let mut sink = RecordingSink::default();
    producer.step(&mut sink).expect("marker fits the window");
    let error = producer
        .step(&mut sink)
        .expect_err("first mutation overruns the window");
    assert_that!(error, eq(&DcpError::WouldBlock));
    assert_that!(producer.is_paused(), eq(true));

    // The consumer acknowledges; the producer resumes exactly where it parked.
    producer.handle_buffer_ack(100);
    producer.step(&mut sink).expect("mutation now fits");
    assert_that!(producer.is_paused(), eq(false));
    let seqnos = sink
        .sent
        .iter()
        .filter_map(DcpResponse::by_seqno)
        .collect::<Vec<_>>();
    assert_that!(seqnos, eq(&vec![1_u64]));
}

#[rstest]
fn compressed_values_are_inflated_for_plain_consumers() {
    let json = br#"{"product": "car", "price": "100"}, {"product": "bus", "price": "1000"}"#;
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        let mut item = Item::mutation(0, b"key1".to_vec(), deflate(json).expect("deflates"));
        item.datatype = DATATYPE_JSON | DATATYPE_SNAPPY;
        guard.store(item).expect("stores");
        guard.uuid()
    };
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "replication:inflate", producer_flags())
        .expect("producer opens");
    producer.set_snappy_enabled(false);
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");
    let _ = producer.run_snapshot_processor().expect("processor pass");

    let sent = drain_producer(&producer);
    let mutation = sent
        .iter()
        .find_map(|response| match response {
            DcpResponse::Mutation(mutation) => Some(mutation),
            _ => None,
        })
        .expect("one mutation on the wire");
    assert_that!(mutation.item.value.as_slice(), eq(json.as_slice()));
    assert_that!(mutation.item.datatype & DATATYPE_SNAPPY, eq(0_u8));
    // The accounted size reflects the inflated encoding.
    assert_that!(
        mutation.message_size()
            >= tide_proto::codec::MUTATION_BASE_MSG_BYTES + 4 + json.len(),
        eq(true)
    );
}

#[rstest]
fn xattr_only_stream_prunes_the_document_body() {
    let body = br#"{"field":"body"}"#;
    let full_value = build_xattr_value(&[(b"sync", b"token")], body);
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let vb_uuid = {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        let mut item = Item::mutation(0, b"key1".to_vec(), full_value.clone());
        item.datatype = DATATYPE_JSON | DATATYPE_XATTR;
        guard.store(item).expect("stores");
        guard.uuid()
    };
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(
            1,
            "replication:xattr",
            OpenFlags(OpenFlags::PRODUCER | OpenFlags::INCLUDE_XATTRS | OpenFlags::NO_VALUE),
        )
        .expect("producer opens");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");
    let _ = producer.run_snapshot_processor().expect("processor pass");

    let sent = drain_producer(&producer);
    let mutation = sent
        .iter()
        .find_map(|response| match response {
            DcpResponse::Mutation(mutation) => Some(mutation),
            _ => None,
        })
        .expect("one mutation on the wire");
    assert_that!(
        mutation.item.value.len(),
        eq(xattr_section_len(&full_value).expect("section length"))
    );
    assert_that!(mutation.item.datatype, eq(DATATYPE_XATTR));
}

#[rstest]
fn buffered_consumer_messages_never_overtake_each_other() {
    let config = EngineConfig {
        max_size: 1000,
        replication_throttle_threshold: 0.5,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    let _ = stream.pop_ready();
    consumer
        .snapshot_marker(1, 0, 1, 100, MarkerFlags::MEMORY)
        .expect("marker applies");

    // Force the replication throttle, park seqno 1 in the buffer.
    bucket.memory().account_alloc(900);
    let error = consumer
        .mutation(1, 0, b"key-1".to_vec(), b"x".to_vec(), 0, 0, 1, 0, Vec::new())
        .expect_err("throttled message buffers");
    assert_that!(matches!(error, DcpError::TempFail(_)), eq(true));
    assert_that!(stream.num_buffer_items(), eq(1_usize));

    // Memory recovers, but seqno 2 must still queue behind the buffered seqno 1.
    bucket.memory().set_max_data_size(1 << 20);
    let error = consumer
        .mutation(1, 0, b"key-2".to_vec(), b"x".to_vec(), 0, 0, 2, 0, Vec::new())
        .expect_err("newer message buffers behind");
    assert_that!(matches!(error, DcpError::TempFail(_)), eq(true));
    assert_that!(stream.buffered_seqnos(), eq(&vec![1_u64, 2]));

    assert_that!(
        consumer.process_buffered_items(),
        eq(ProcessBufferedResult::AllProcessed)
    );

    // Applied strictly in order: the checkpoint sequence is 1 then 2.
    let drained = {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        assert_that!(guard.high_seqno(), eq(2_u64));
        guard
            .checkpoints
            .register_cursor("probe", 0)
            .expect("probe cursor");
        guard.checkpoints.drain_cursor("probe", 10)
    };
    let seqnos = drained
        .iter()
        .filter_map(|entry| match entry {
            tide_storage::checkpoint::CursorEntry::Item(item) => Some(item.by_seqno),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_that!(seqnos, eq(&vec![1_u64, 2]));

    // With the buffer empty, a new message applies directly.
    consumer
        .mutation(1, 0, b"key-3".to_vec(), b"x".to_vec(), 0, 0, 3, 0, Vec::new())
        .expect("applies in place");
    assert_that!(stream.num_buffer_items(), eq(0_usize));
}
