use googletest::prelude::*;
use rstest::rstest;
use std::sync::Arc;

use tide_common::config::{EngineConfig, EphemeralFullPolicy};
use tide_common::error::DcpError;
use tide_proto::codec::DELETION_BASE_MSG_BYTES;
use tide_proto::message::{MarkerFlags, StreamEndReason};
use tide_storage::vbucket::VbState;

use super::testkit::{
    CountingCookieHost, RecordingSink, TooBigNoopSink, bucket_with_vbucket, drain_consumer,
    drain_producer, producer_flags, seed_active_items, vbucket_uuid,
};
use crate::connmap::{CookieHost, DcpConnMap, NullCookieHost};
use crate::passive_stream::ProcessBufferedResult;
use crate::producer::{
    DisconnectDecision, NoopOutcome, StreamRequestOutcome, current_time_secs,
};
use crate::response::DcpResponse;

fn default_connmap(state: VbState) -> (DcpConnMap, Arc<tide_storage::bucket::KvBucket>) {
    let bucket = bucket_with_vbucket(EngineConfig::default(), state);
    (
        DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost)),
        bucket,
    )
}

#[rstest]
fn noop_interval_must_be_a_multiple_of_the_manager_interval() {
    let config = EngineConfig {
        connection_manager_interval_secs: 2,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Active);
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    let error = producer
        .control("set_noop_interval", "1")
        .expect_err("one second does not fit a two second manager interval");
    assert_that!(matches!(error, DcpError::InvalidArgument(_)), eq(true));

    producer
        .control("set_noop_interval", "2")
        .expect("two seconds fits exactly");
}

#[rstest]
fn noop_send_failure_leaves_noop_state_untouched() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    producer.set_noop_enabled(true);
    let send_time = current_time_secs() - 30;
    producer.set_noop_send_time(send_time);

    let mut sink = TooBigNoopSink;
    let error = producer
        .maybe_send_noop(&mut sink)
        .expect_err("wire refused the noop");
    assert_that!(error, eq(&DcpError::TooBig));
    assert_that!(producer.noop_pending_recv(), eq(false));
    assert_that!(producer.noop_send_time(), eq(send_time));
}

#[rstest]
fn due_noop_is_sent_and_marked_pending() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    producer.set_noop_enabled(true);
    producer.set_noop_send_time(current_time_secs() - 30);

    let mut sink = RecordingSink::default();
    let outcome = producer.maybe_send_noop(&mut sink).expect("noop sends");
    assert_that!(outcome, eq(NoopOutcome::Sent));
    assert_that!(producer.noop_pending_recv(), eq(true));
    assert_that!(
        matches!(sink.sent[0], DcpResponse::Noop { .. }),
        eq(true)
    );

    // The client's noop response clears the pending flag through the response path.
    let response = tide_proto::codec::DcpFrame::response(
        tide_proto::message::Opcode::Noop,
        0,
        crate::producer::NOOP_OPAQUE,
    );
    assert_that!(producer.handle_response(&response), eq(true));
    assert_that!(producer.noop_pending_recv(), eq(false));
}

#[rstest]
fn noop_is_not_sent_when_disabled_or_not_due() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    let mut sink = RecordingSink::default();
    assert_that!(
        producer.maybe_send_noop(&mut sink).expect("runs"),
        eq(NoopOutcome::Disabled)
    );

    producer.set_noop_enabled(true);
    producer.set_noop_send_time(current_time_secs());
    assert_that!(
        producer.maybe_send_noop(&mut sink).expect("runs"),
        eq(NoopOutcome::NotDue)
    );
    assert_that!(sink.sent.is_empty(), eq(true));
}

#[rstest]
fn unanswered_noop_past_the_idle_timeout_disconnects() {
    let config = EngineConfig {
        dcp_idle_timeout_secs: 100,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Active);
    let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    producer.set_noop_enabled(true);
    producer.set_noop_send_time(current_time_secs() - 30);

    let mut sink = RecordingSink::default();
    assert_that!(
        producer.maybe_send_noop(&mut sink).expect("noop sends"),
        eq(NoopOutcome::Sent)
    );
    assert_that!(producer.maybe_disconnect(), eq(DisconnectDecision::NoAction));

    producer.set_last_receive_time(current_time_secs() - 101);
    assert_that!(
        producer.maybe_disconnect(),
        eq(DisconnectDecision::Disconnect)
    );
    assert_that!(producer.do_disconnect(), eq(true));
}

#[rstest]
fn dead_connections_are_reaped_by_manage_connections() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let _ = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    connmap.disconnect(1);
    assert_that!(connmap.dead_connections_count(), eq(1_usize));
    assert_that!(connmap.find_by_cookie(1).is_none(), eq(true));

    assert_that!(connmap.manage_connections(), eq(1_usize));
    assert_that!(connmap.dead_connections_count(), eq(0_usize));
}

#[rstest]
fn duplicate_name_producers_leave_one_live_connection() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let first = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("first opens");
    let second = connmap
        .new_producer(2, "test_producer", producer_flags())
        .expect("second supersedes");
    let third = connmap
        .new_producer(3, "test_producer", producer_flags())
        .expect("third supersedes");

    assert_that!(first.do_disconnect(), eq(true));
    assert_that!(second.do_disconnect(), eq(true));
    assert_that!(third.do_disconnect(), eq(false));

    let found = connmap.find_by_name("test_producer").expect("name resolves");
    assert_that!(found.cookie(), eq(3_u64));

    // Nothing was disconnected yet, so there is nothing to reap.
    assert_that!(connmap.manage_connections(), eq(0_usize));
    assert_that!(connmap.dead_connections_count(), eq(0_usize));
}

#[rstest]
fn duplicate_name_consumers_leave_one_live_connection() {
    let (connmap, _bucket) = default_connmap(VbState::Replica);
    let first = connmap.new_consumer(1, "test_consumer").expect("first opens");
    let second = connmap
        .new_consumer(2, "test_consumer")
        .expect("second supersedes");

    assert_that!(first.do_disconnect(), eq(true));
    assert_that!(second.do_disconnect(), eq(false));
    let found = connmap.find_by_name("test_consumer").expect("name resolves");
    assert_that!(found.cookie(), eq(2_u64));
}

#[rstest]
fn duplicate_cookie_consumer_is_rejected() {
    let (connmap, _bucket) = default_connmap(VbState::Replica);
    let first = connmap.new_consumer(9, "c1").expect("first opens");
    let second = connmap.new_consumer(9, "c2");

    assert_that!(second.is_none(), eq(true));
    assert_that!(first.do_disconnect(), eq(true));
}

#[rstest]
fn close_stream_with_negotiated_end_emits_it_and_allows_reopen() {
    let (connmap, bucket) = default_connmap(VbState::Active);
    let vb_uuid = vbucket_uuid(&bucket, 0);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    producer
        .control("send_stream_end_on_client_close_stream", "true")
        .expect("control accepted");

    let outcome = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");
    assert_that!(
        matches!(outcome, StreamRequestOutcome::Accepted { .. }),
        eq(true)
    );

    producer.close_stream(0, 0).expect("close accepted");
    let sent = drain_producer(&producer);
    let DcpResponse::StreamEnd { reason, .. } = &sent[0] else {
        panic!("expected a stream end message");
    };
    assert_that!(*reason, eq(StreamEndReason::Closed));

    // The vBucket slot is free again and a fresh in-memory stream can open.
    let reopened = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream reopens");
    assert_that!(
        matches!(reopened, StreamRequestOutcome::Accepted { .. }),
        eq(true)
    );
    assert_that!(producer.has_live_stream(0), eq(true));
}

#[rstest]
fn close_stream_without_negotiated_end_removes_synchronously() {
    let (connmap, bucket) = default_connmap(VbState::Active);
    let vb_uuid = vbucket_uuid(&bucket, 0);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");

    producer.close_stream(0, 0).expect("close accepted");
    assert_that!(producer.has_live_stream(0), eq(false));
    assert_that!(producer.stream_state(0), eq(None));
    assert_that!(drain_producer(&producer).is_empty(), eq(true));
}

#[rstest]
fn unknown_control_key_is_an_invalid_argument() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    let error = producer
        .control("frobnicate", "hard")
        .expect_err("unknown keys are rejected");
    assert_that!(matches!(error, DcpError::InvalidArgument(_)), eq(true));
    // The connection and its streams survive the rejection.
    assert_that!(producer.do_disconnect(), eq(false));
}

#[rstest]
fn stats_reads_after_disconnect_do_not_crash() {
    let (connmap, _bucket) = default_connmap(VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    connmap.disconnect(1);

    let mut stats = Vec::new();
    producer.add_stats(&mut |key, value| stats.push((key.to_owned(), value)));
    assert_that!(stats.is_empty(), eq(false));
    assert_that!(
        stats.iter().any(|(key, _)| key == "name"),
        eq(true)
    );
}

#[rstest]
fn shutdown_notifies_every_paused_connection_at_least_once() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    let host = Arc::new(CountingCookieHost::default());
    let connmap = DcpConnMap::new(bucket, Arc::clone(&host) as Arc<dyn CookieHost>);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    // Producers start parked until their first successful step.
    assert_that!(producer.is_paused(), eq(true));

    // The periodic notifier alone must not wake a connection with nothing pending.
    connmap.process_pending_notifications();
    assert_that!(host.notify_count(), eq(0_usize));

    connmap.shutdown_all_connections();
    assert_that!(host.notify_count() >= 1, eq(true));
    assert_that!(connmap.connection_count(), eq(0_usize));
    assert_that!(connmap.dead_connections_count(), eq(0_usize));
}

#[rstest]
fn shutdown_notifies_paused_consumers_too() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Replica);
    let host = Arc::new(CountingCookieHost::default());
    let connmap = DcpConnMap::new(bucket, Arc::clone(&host) as Arc<dyn CookieHost>);
    let consumer = connmap.new_consumer(2, "test_consumer").expect("opens");

    // Step the negotiation ladder dry so the connection parks.
    let _ = drain_consumer(&consumer);
    assert_that!(consumer.is_paused(), eq(true));

    connmap.process_pending_notifications();
    assert_that!(host.notify_count(), eq(0_usize));

    connmap.shutdown_all_connections();
    assert_that!(host.notify_count() >= 1, eq(true));
    assert_that!(connmap.connection_count(), eq(0_usize));
}

#[rstest]
fn pending_notifications_reach_only_paused_connections() {
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Replica);
    let host = Arc::new(CountingCookieHost::default());
    let connmap = DcpConnMap::new(bucket, Arc::clone(&host) as Arc<dyn CookieHost>);
    let consumer = connmap.new_consumer(2, "test_consumer").expect("opens");

    // Not paused yet: the pending entry is dropped without a notification.
    connmap.add_connection_to_pending(2);
    connmap.process_pending_notifications();
    assert_that!(host.notify_count(), eq(0_usize));

    // Once parked, a pending entry produces exactly one notification.
    let _ = drain_consumer(&consumer);
    assert_that!(consumer.is_paused(), eq(true));
    connmap.add_connection_to_pending(2);
    connmap.process_pending_notifications();
    assert_that!(host.notify_count(), eq(1_usize));

    // The set was drained; a second pass is silent until re-added.
    connmap.process_pending_notifications();
    assert_that!(host.notify_count(), eq(1_usize));
}

#[rstest]
fn deletion_response_size_is_exact() {
    let (connmap, _bucket) = default_connmap(VbState::Replica);
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    let _ = stream.pop_ready();

    consumer
        .snapshot_marker(1, 0, 1, 10, MarkerFlags::MEMORY)
        .expect("marker applies");
    consumer
        .deletion(1, 0, b"key".to_vec(), Vec::new(), 1, 0, vec![0x01])
        .expect("deletion applies");

    assert_that!(
        stream.response_message_size(),
        eq(DELETION_BASE_MSG_BYTES + 3 + 1)
    );
}

#[rstest]
fn mutation_response_size_is_exact() {
    let (connmap, _bucket) = default_connmap(VbState::Replica);
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    let stream = consumer.get_vbucket_stream(0).expect("stream exists");
    let _ = stream.pop_ready();

    consumer
        .snapshot_marker(1, 0, 1, 10, MarkerFlags::MEMORY)
        .expect("marker applies");
    let data = br#"{"json":"yes"}"#.to_vec();
    consumer
        .mutation(1, 0, b"key".to_vec(), data.clone(), 0x01, 0, 1, 0, vec![0x01])
        .expect("mutation applies");

    use tide_proto::codec::MUTATION_BASE_MSG_BYTES;
    assert_that!(
        stream.response_message_size(),
        eq(MUTATION_BASE_MSG_BYTES + 3 + data.len() + 1)
    );
}

#[rstest]
fn ephemeral_fail_new_data_disconnects_past_the_threshold() {
    let config = EngineConfig {
        ephemeral: true,
        ephemeral_full_policy: EphemeralFullPolicy::FailNewData,
        max_size: 1000,
        replication_throttle_threshold: 0.5,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    consumer
        .snapshot_marker(1, 0, 1, u64::MAX, MarkerFlags::MEMORY)
        .expect("marker applies");

    bucket.memory().account_alloc(900);
    let error = consumer
        .mutation(1, 0, b"key".to_vec(), b"value".to_vec(), 0, 0, 1, 0, Vec::new())
        .expect_err("threshold crossed");
    assert_that!(matches!(error, DcpError::Disconnect(_)), eq(true));

    // Every subsequent step reports the disconnect.
    let mut sink = RecordingSink::default();
    let step_error = consumer.step(&mut sink).expect_err("connection is done");
    assert_that!(matches!(step_error, DcpError::Disconnect(_)), eq(true));
}

#[rstest]
fn buffering_policy_parks_messages_until_the_threshold_relaxes() {
    let config = EngineConfig {
        max_size: 1000,
        replication_throttle_threshold: 0.5,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");
    consumer
        .snapshot_marker(1, 0, 1, u64::MAX, MarkerFlags::MEMORY)
        .expect("marker applies");

    bucket.memory().account_alloc(900);
    let error = consumer
        .mutation(1, 0, b"key".to_vec(), b"value".to_vec(), 0, 0, 1, 0, Vec::new())
        .expect_err("throttled message buffers");
    assert_that!(matches!(error, DcpError::TempFail(_)), eq(true));

    assert_that!(
        consumer.process_buffered_items(),
        eq(ProcessBufferedResult::CannotProcess)
    );

    bucket.memory().set_max_data_size(1 << 20);
    assert_that!(
        consumer.process_buffered_items(),
        eq(ProcessBufferedResult::AllProcessed)
    );
}

#[rstest]
fn disk_phase_checkpoint_ids_follow_the_backfill_queue_config() {
    // With the backfill queue, the disk phase renumbers to zero and the next memory
    // snapshot opens checkpoint one.
    let bucket = bucket_with_vbucket(EngineConfig::default(), VbState::Active);
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.create_checkpoint(), eq(2_u64));
    }
    bucket.set_vb_state(0, VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");

    consumer
        .snapshot_marker(1, 0, 1, 10, MarkerFlags::DISK)
        .expect("disk marker applies");
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.open_checkpoint_id(), eq(0_u64));
    }

    consumer
        .snapshot_marker(1, 0, 11, 20, MarkerFlags::MEMORY)
        .expect("memory marker applies");
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.open_checkpoint_id(), eq(1_u64));
    }
}

#[rstest]
fn without_the_backfill_queue_the_checkpoint_id_is_preserved() {
    let config = EngineConfig {
        disk_backfill_queue: false,
        ..EngineConfig::default()
    };
    let bucket = bucket_with_vbucket(config, VbState::Active);
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let mut guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.create_checkpoint(), eq(2_u64));
    }
    bucket.set_vb_state(0, VbState::Replica);
    let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
    let consumer = connmap.new_consumer(1, "test_consumer").expect("opens");
    consumer.add_stream(0, 0, 0).expect("stream added");

    consumer
        .snapshot_marker(1, 0, 1, 10, MarkerFlags::DISK)
        .expect("disk marker applies");
    let checkpoints_before = {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.open_checkpoint_id(), eq(2_u64));
        guard.checkpoints.num_checkpoints()
    };

    // While the disk snapshot is inbound, a producer on the same vBucket must back off.
    let producer = connmap
        .new_producer(7, "concurrent_producer", producer_flags())
        .expect("producer opens");
    let error = producer
        .stream_request(0, 9, 0, 0, u64::MAX, vbucket_uuid(&bucket, 0), 0, 0)
        .expect_err("disk snapshot in progress");
    assert_that!(matches!(error, DcpError::TempFail(_)), eq(true));

    consumer
        .snapshot_marker(1, 0, 11, 20, MarkerFlags::MEMORY)
        .expect("memory marker applies");
    {
        let vbucket = bucket.get_vbucket(0).expect("vbucket");
        let guard = vbucket.lock().expect("lock");
        assert_that!(guard.checkpoints.open_checkpoint_id(), eq(2_u64));
        assert_that!(guard.checkpoints.num_checkpoints(), eq(checkpoints_before));
    }

    // The memory marker completed the disk phase; streaming may begin now.
    let outcome = producer
        .stream_request(0, 9, 0, 0, u64::MAX, vbucket_uuid(&bucket, 0), 0, 0)
        .expect("stream accepted");
    assert_that!(
        matches!(outcome, StreamRequestOutcome::Accepted { .. }),
        eq(true)
    );
}

#[rstest]
fn get_failover_log_returns_entries_newest_first() {
    let (connmap, bucket) = default_connmap(VbState::Active);
    bucket.set_vb_state(0, VbState::Replica);
    bucket.set_vb_state(0, VbState::Active);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");

    let log = producer.get_failover_log(0).expect("failover log");
    assert_that!(log.len() >= 2, eq(true));
    assert_that!(log[0].vb_uuid, eq(vbucket_uuid(&bucket, 0)));
}

#[rstest]
fn seeded_items_flow_reach_the_wire_via_the_processor() {
    let (connmap, bucket) = default_connmap(VbState::Active);
    let vb_uuid = seed_active_items(&bucket, 0, 3);
    let producer = connmap
        .new_producer(1, "test_producer", producer_flags())
        .expect("producer opens");
    let _ = producer
        .stream_request(0, 0, 0, 0, u64::MAX, vb_uuid, 0, 0)
        .expect("stream accepted");

    let _ = producer.run_snapshot_processor().expect("processor pass");
    let sent = drain_producer(&producer);
    assert_that!(
        matches!(sent[0], DcpResponse::SnapshotMarker { .. }),
        eq(true)
    );
    let seqnos = sent
        .iter()
        .filter_map(DcpResponse::by_seqno)
        .collect::<Vec<_>>();
    assert_that!(seqnos, eq(&vec![1_u64, 2, 3]));
}
