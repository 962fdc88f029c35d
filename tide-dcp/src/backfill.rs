//! Disk backfills feeding active streams whose history precedes retained checkpoints.

use std::collections::VecDeque;
use std::sync::Mutex;

use tide_common::error::DcpResult;
use tide_common::ids::{Seqno, Vbid};
use tide_storage::vbucket::Vbucket;

use crate::active_stream::ActiveStream;

/// Items scanned per backfill batch before yielding.
pub const BACKFILL_BATCH_LIMIT: usize = 250;
/// Ready-queue byte budget above which a scan pauses until the writer drains.
pub const BACKFILL_BYTE_BUDGET: usize = 20 * 1024 * 1024;

/// Outcome of one backfill batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillRunResult {
    /// Progress was made; more history remains.
    Yielded,
    /// The stream's ready queue is over budget; retry after the writer drains.
    Paused,
    /// The scan finished; in-memory streaming resumes past `resume_seqno`.
    Complete {
        /// Last seqno covered by the scan.
        resume_seqno: Seqno,
    },
}

/// One scheduled disk scan for a `[start, end]` seqno range.
#[derive(Debug)]
pub struct Backfill {
    vbid: Vbid,
    next_seqno: Seqno,
    end_seqno: Seqno,
    marker_sent: bool,
}

impl Backfill {
    /// Creates a scan over `[start_seqno, end_seqno]`.
    #[must_use]
    pub fn new(vbid: Vbid, start_seqno: Seqno, end_seqno: Seqno) -> Self {
        Self {
            vbid,
            next_seqno: start_seqno,
            end_seqno,
            marker_sent: false,
        }
    }

    /// vBucket this scan reads.
    #[must_use]
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Runs one bounded batch of the scan into the stream.
    ///
    /// The first batch emits a single disk-flag snapshot marker covering the whole scan range;
    /// later batches append items inside that snapshot.
    pub fn run(
        &mut self,
        vbucket: &Vbucket,
        stream: &mut ActiveStream,
    ) -> DcpResult<BackfillRunResult> {
        if stream.ready_bytes() > BACKFILL_BYTE_BUDGET {
            return Ok(BackfillRunResult::Paused);
        }
        if self.next_seqno > self.end_seqno {
            return Ok(BackfillRunResult::Complete {
                resume_seqno: self.next_seqno.saturating_sub(1),
            });
        }

        let batch_end = self
            .end_seqno
            .min(self.next_seqno.saturating_add(BACKFILL_BATCH_LIMIT as u64 - 1));
        let items = vbucket.read_disk_range(self.next_seqno, batch_end);

        if self.marker_sent {
            stream.accept_backfill_items(items)?;
        } else {
            stream.accept_backfill_snapshot(self.end_seqno, items)?;
            self.marker_sent = true;
        }

        self.next_seqno = batch_end.saturating_add(1);
        if self.next_seqno > self.end_seqno {
            Ok(BackfillRunResult::Complete {
                resume_seqno: self.end_seqno,
            })
        } else {
            Ok(BackfillRunResult::Yielded)
        }
    }
}

/// Queue of scheduled backfills for one producer connection.
#[derive(Debug, Default)]
pub struct BackfillManager {
    queue: Mutex<VecDeque<Backfill>>,
}

impl BackfillManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a scan.
    pub fn schedule(&self, vbid: Vbid, start_seqno: Seqno, end_seqno: Seqno) {
        self.lock().push_back(Backfill::new(vbid, start_seqno, end_seqno));
    }

    /// Takes the next scheduled scan.
    pub fn take_next(&self) -> Option<Backfill> {
        self.lock().pop_front()
    }

    /// Returns a paused scan to the front of the queue.
    pub fn requeue(&self, backfill: Backfill) {
        self.lock().push_front(backfill);
    }

    /// Number of scheduled scans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no scans are scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Backfill>> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{Backfill, BackfillManager, BackfillRunResult};
    use crate::active_stream::ActiveStream;
    use crate::response::DcpResponse;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use tide_proto::message::MarkerFlags;
    use tide_proto::value::TransportPolicy;
    use tide_storage::item::Item;
    use tide_storage::memory::MemoryTracker;
    use tide_storage::vbucket::{VbState, Vbucket};

    fn persisted_vbucket(count: u64) -> Vbucket {
        let mut vb = Vbucket::new(
            0,
            VbState::Active,
            0xA0,
            Arc::new(MemoryTracker::new(1 << 24, 0.9)),
        );
        for seqno in 1..=count {
            vb.store(Item::mutation(
                0,
                format!("key-{seqno}").into_bytes(),
                b"v".to_vec(),
            ))
            .expect("stores");
        }
        let _ = vb.flush();
        vb
    }

    fn backfilling_stream() -> ActiveStream {
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
    }

    #[rstest]
    fn scan_emits_one_disk_marker_then_items_in_order() {
        let vb = persisted_vbucket(3);
        let mut stream = backfilling_stream();
        let mut backfill = Backfill::new(0, 1, 3);

        let result = backfill.run(&vb, &mut stream).expect("runs");
        assert_that!(result, eq(BackfillRunResult::Complete { resume_seqno: 3 }));

        let DcpResponse::SnapshotMarker {
            start_seqno,
            end_seqno,
            flags,
            ..
        } = stream.next_response().expect("marker")
        else {
            panic!("expected a disk snapshot marker first");
        };
        assert_that!(start_seqno, eq(1_u64));
        assert_that!(end_seqno, eq(3_u64));
        assert_that!(flags, eq(MarkerFlags::DISK));

        let seqnos = std::iter::from_fn(|| stream.next_response())
            .filter_map(|response| response.by_seqno())
            .collect::<Vec<_>>();
        assert_that!(seqnos, eq(&vec![1_u64, 2, 3]));
    }

    #[rstest]
    fn empty_history_completes_without_a_scan() {
        let vb = persisted_vbucket(0);
        let mut stream = backfilling_stream();
        let mut backfill = Backfill::new(0, 1, 0);

        let result = backfill.run(&vb, &mut stream).expect("runs");
        assert_that!(result, eq(BackfillRunResult::Complete { resume_seqno: 0 }));
    }

    #[rstest]
    fn manager_hands_out_scans_in_schedule_order() {
        let manager = BackfillManager::new();
        manager.schedule(0, 1, 10);
        manager.schedule(1, 1, 20);
        assert_that!(manager.len(), eq(2_usize));

        let first = manager.take_next().expect("first scan");
        assert_that!(first.vbid(), eq(0_u16));
        manager.requeue(first);
        let again = manager.take_next().expect("requeued scan");
        assert_that!(again.vbid(), eq(0_u16));
    }
}
