//! Background task objects scheduled on the task pool.
//!
//! Each task is a plain object with a `run` method so tests can drive it deterministically;
//! production wiring submits the same objects to the pool.

use std::sync::Arc;

use tracing::warn;

use crate::connmap::{ConnHandle, DcpConnMap};
use crate::consumer::DcpConsumer;
use crate::passive_stream::ProcessBufferedResult;
use crate::producer::{DcpProducer, DisconnectDecision};

/// Drains checkpoint cursors for one producer connection in bounded batches.
#[derive(Debug, Clone)]
pub struct SnapshotProcessorTask {
    producer: Arc<DcpProducer>,
}

impl SnapshotProcessorTask {
    /// Creates the task for one producer.
    #[must_use]
    pub fn new(producer: Arc<DcpProducer>) -> Self {
        Self { producer }
    }

    /// Runs one pass; returns whether any stream produced responses.
    pub fn run(&self) -> bool {
        match self.producer.run_snapshot_processor() {
            Ok(produced) => produced,
            Err(error) => {
                warn!(
                    connection = self.producer.name(),
                    %error,
                    "snapshot processor pass failed"
                );
                false
            }
        }
    }
}

/// Drains one consumer's buffered messages toward storage.
#[derive(Debug, Clone)]
pub struct ConsumerProcessorTask {
    consumer: Arc<DcpConsumer>,
}

impl ConsumerProcessorTask {
    /// Creates the task for one consumer.
    #[must_use]
    pub fn new(consumer: Arc<DcpConsumer>) -> Self {
        Self { consumer }
    }

    /// Runs one pass over every stream's buffer.
    #[must_use]
    pub fn run(&self) -> ProcessBufferedResult {
        self.consumer.process_buffered_items()
    }
}

/// Periodic connection upkeep: reaping, notifications, and noop idle timeouts.
#[derive(Debug, Clone)]
pub struct ConnectionManagerTask {
    connmap: DcpConnMap,
}

impl ConnectionManagerTask {
    /// Creates the task for one registry.
    #[must_use]
    pub fn new(connmap: DcpConnMap) -> Self {
        Self { connmap }
    }

    /// Runs one upkeep pass; returns the number of connections reaped.
    pub fn run(&self, producers: &[Arc<DcpProducer>]) -> usize {
        for producer in producers {
            if producer.maybe_disconnect() == DisconnectDecision::Disconnect {
                self.connmap.disconnect(producer.cookie());
            }
        }
        self.connmap.process_pending_notifications();
        self.connmap.manage_connections()
    }
}

/// Collects the registry's current producers for an upkeep pass.
#[must_use]
pub fn registered_producers(connmap: &DcpConnMap, cookies: &[u64]) -> Vec<Arc<DcpProducer>> {
    cookies
        .iter()
        .filter_map(|cookie| match connmap.find_by_cookie(*cookie) {
            Some(ConnHandle::Producer(producer)) => Some(producer),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{ConsumerProcessorTask, SnapshotProcessorTask};
    use crate::connmap::{DcpConnMap, NullCookieHost};
    use crate::passive_stream::ProcessBufferedResult;
    use crate::producer::StreamRequestOutcome;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use tide_common::config::EngineConfig;
    use tide_proto::message::OpenFlags;
    use tide_storage::bucket::KvBucket;
    use tide_storage::item::Item;
    use tide_storage::vbucket::VbState;

    #[rstest]
    fn snapshot_processor_moves_checkpoint_items_to_the_stream() {
        let bucket = Arc::new(KvBucket::new(EngineConfig::default()));
        bucket.set_vb_state(0, VbState::Active);
        let vb_uuid = {
            let vbucket = bucket.get_vbucket(0).expect("vbucket");
            let mut guard = vbucket.lock().expect("lock");
            guard
                .store(Item::mutation(0, b"k".to_vec(), b"v".to_vec()))
                .expect("stores");
            guard.uuid()
        };

        let connmap = DcpConnMap::new(Arc::clone(&bucket), Arc::new(NullCookieHost));
        let producer = connmap
            .new_producer(1, "replication:a", OpenFlags(OpenFlags::PRODUCER))
            .expect("producer opens");
        let outcome = producer
            .stream_request(0, 10, 0, 0, u64::MAX, vb_uuid, 0, 0)
            .expect("stream accepted");
        assert_that!(
            matches!(outcome, StreamRequestOutcome::Accepted { .. }),
            eq(true)
        );

        let task = SnapshotProcessorTask::new(Arc::clone(&producer));
        assert_that!(task.run(), eq(true));
        // A second pass with no new items produces nothing.
        assert_that!(task.run(), eq(false));
    }

    #[rstest]
    fn connection_manager_reaps_idle_timed_out_producers() {
        use super::{ConnectionManagerTask, registered_producers};
        use crate::producer::{MessageSink, current_time_secs};
        use crate::response::DcpResponse;
        use tide_common::error::DcpResult;

        struct DropSink;
        impl MessageSink for DropSink {
            fn send(&mut self, _message: &DcpResponse) -> DcpResult<()> {
                Ok(())
            }
        }

        let config = EngineConfig {
            dcp_idle_timeout_secs: 60,
            ..EngineConfig::default()
        };
        let bucket = Arc::new(KvBucket::new(config));
        let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
        let producer = connmap
            .new_producer(5, "replication:idle", OpenFlags(OpenFlags::PRODUCER))
            .expect("producer opens");
        producer.set_noop_enabled(true);
        producer.set_noop_send_time(current_time_secs() - 30);
        let mut sink = DropSink;
        let _ = producer.maybe_send_noop(&mut sink).expect("noop sends");
        producer.set_last_receive_time(current_time_secs() - 61);

        let task = ConnectionManagerTask::new(connmap.clone());
        let producers = registered_producers(&connmap, &[5]);
        assert_that!(producers.len(), eq(1_usize));
        assert_that!(task.run(&producers), eq(1_usize));
        assert_that!(connmap.find_by_cookie(5).is_none(), eq(true));
        assert_that!(connmap.dead_connections_count(), eq(0_usize));
    }

    #[rstest]
    fn consumer_processor_reports_an_empty_buffer() {
        let bucket = Arc::new(KvBucket::new(EngineConfig::default()));
        bucket.set_vb_state(0, VbState::Replica);
        let connmap = DcpConnMap::new(bucket, Arc::new(NullCookieHost));
        let consumer = connmap
            .new_consumer(2, "replication:b")
            .expect("consumer opens");
        consumer.add_stream(0, 0, 0).expect("stream added");

        let task = ConsumerProcessorTask::new(consumer);
        assert_that!(task.run(), eq(ProcessBufferedResult::AllProcessed));
    }
}
