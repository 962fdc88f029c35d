//! Bucket-level composition: vBucket map, quota tracking, and the flusher entry point.

use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::HashMap;

use tide_common::config::EngineConfig;
use tide_common::error::{DcpError, DcpResult};
use tide_common::ids::{VbUuid, Vbid};

use crate::memory::MemoryTracker;
use crate::vbucket::{FlushResult, VbState, Vbucket};

/// Owner of all vBuckets in one bucket.
///
/// vBuckets are wrapped individually so stream processing for different vBuckets never
/// serializes on a bucket-wide lock.
#[derive(Debug)]
pub struct KvBucket {
    config: EngineConfig,
    memory: Arc<MemoryTracker>,
    vbuckets: Mutex<HashMap<Vbid, Arc<Mutex<Vbucket>>>>,
    next_uuid: Mutex<VbUuid>,
}

impl KvBucket {
    /// Creates an empty bucket from engine configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let memory = Arc::new(MemoryTracker::new(
            config.max_size,
            config.replication_throttle_threshold,
        ));
        Self {
            config,
            memory,
            vbuckets: Mutex::new(HashMap::new()),
            next_uuid: Mutex::new(0xA000),
        }
    }

    /// Returns the engine configuration this bucket was built from.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the shared memory tracker.
    #[must_use]
    pub fn memory(&self) -> Arc<MemoryTracker> {
        Arc::clone(&self.memory)
    }

    fn vbuckets_guard(&self) -> MutexGuard<'_, HashMap<Vbid, Arc<Mutex<Vbucket>>>> {
        self.vbuckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn allocate_uuid(&self) -> VbUuid {
        let mut guard = self
            .next_uuid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let uuid = *guard;
        *guard = guard.wrapping_add(1);
        uuid
    }

    /// Creates the vBucket if missing and moves it to `state`.
    pub fn set_vb_state(&self, vbid: Vbid, state: VbState) {
        let mut guard = self.vbuckets_guard();
        if let Some(vbucket) = guard.get(&vbid) {
            vbucket
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .set_state(state, Some(self.allocate_uuid()));
            return;
        }
        let uuid = self.allocate_uuid();
        guard.insert(
            vbid,
            Arc::new(Mutex::new(Vbucket::new(
                vbid,
                state,
                uuid,
                Arc::clone(&self.memory),
            ))),
        );
    }

    /// Returns a handle to one vBucket.
    #[must_use]
    pub fn get_vbucket(&self, vbid: Vbid) -> Option<Arc<Mutex<Vbucket>>> {
        self.vbuckets_guard().get(&vbid).map(Arc::clone)
    }

    /// Returns a handle, failing with `NotSupported` when the vBucket does not exist.
    pub fn require_vbucket(&self, vbid: Vbid) -> DcpResult<Arc<Mutex<Vbucket>>> {
        self.get_vbucket(vbid)
            .ok_or(DcpError::NotSupported("no such vbucket"))
    }

    /// Persists the dirty batch of one vBucket.
    pub fn flush_vbucket(&self, vbid: Vbid) -> DcpResult<FlushResult> {
        let vbucket = self.require_vbucket(vbid)?;
        let mut guard = vbucket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(guard.flush())
    }
}

#[cfg(test)]
mod tests {
    use super::KvBucket;
    use crate::item::Item;
    use crate::vbucket::VbState;
    use googletest::prelude::*;
    use rstest::rstest;
    use tide_common::config::EngineConfig;

    #[rstest]
    fn set_vb_state_creates_and_transitions() {
        let bucket = KvBucket::new(EngineConfig::default());
        assert_that!(bucket.get_vbucket(0).is_none(), eq(true));

        bucket.set_vb_state(0, VbState::Replica);
        let vbucket = bucket.get_vbucket(0).expect("created");
        assert_that!(vbucket.lock().expect("lock").state(), eq(VbState::Replica));

        bucket.set_vb_state(0, VbState::Active);
        assert_that!(vbucket.lock().expect("lock").state(), eq(VbState::Active));
    }

    #[rstest]
    fn distinct_vbuckets_get_distinct_uuids() {
        let bucket = KvBucket::new(EngineConfig::default());
        bucket.set_vb_state(0, VbState::Active);
        bucket.set_vb_state(1, VbState::Active);

        let first = bucket.get_vbucket(0).expect("vb 0");
        let second = bucket.get_vbucket(1).expect("vb 1");
        let first_uuid = first.lock().expect("lock").uuid();
        let second_uuid = second.lock().expect("lock").uuid();
        assert_that!(first_uuid == second_uuid, eq(false));
    }

    #[rstest]
    fn flush_routes_to_the_owning_vbucket() {
        let bucket = KvBucket::new(EngineConfig::default());
        bucket.set_vb_state(0, VbState::Active);
        {
            let vbucket = bucket.get_vbucket(0).expect("vb 0");
            let mut guard = vbucket.lock().expect("lock");
            guard
                .store(Item::mutation(0, b"k".to_vec(), b"v".to_vec()))
                .expect("stores");
        }
        let result = bucket.flush_vbucket(0).expect("flushes");
        assert_that!(result.num_flushed, eq(1_usize));

        assert_that!(bucket.flush_vbucket(9).is_err(), eq(true));
    }
}
