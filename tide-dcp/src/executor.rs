//! Worker pool consumed through the task-scheduling contract.
//!
//! Connection upkeep, snapshot processing, and backfills run on pool workers (the NonIO and
//! AuxIO domains). Each task binds to one stable worker so per-connection work never runs
//! concurrently with itself; each worker hosts a current-thread runtime and executes jobs
//! inside local tasks.

use std::sync::mpsc as std_mpsc;
use std::thread;

use tide_common::error::{DcpError, DcpResult};
use tokio::runtime::Builder as TokioBuilder;
use tokio::sync::mpsc;
use tokio::task::LocalSet;

/// One unit of work handed to a pool worker.
struct PoolJob {
    job: Box<dyn FnOnce() + Send>,
    done: Option<std_mpsc::Sender<()>>,
}

const POOL_WORKER_YIELD_INTERVAL: usize = 64;

/// Stable task-to-worker binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskAffinity {
    /// Logical task id (typically the connection cookie).
    pub task_id: u64,
    /// Worker index that owns this task's execution.
    pub worker: u16,
}

/// In-process worker pool with one thread per queue.
pub struct TaskPool {
    worker_count: u16,
    senders: Vec<mpsc::UnboundedSender<PoolJob>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("worker_count", &self.worker_count)
            .field("senders", &self.senders.len())
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl TaskPool {
    /// Creates a pool.
    ///
    /// `worker_count == 0` is normalized to `1`.
    #[must_use]
    pub fn new(worker_count: u16) -> Self {
        let worker_count = worker_count.max(1);
        let worker_len = usize::from(worker_count);
        let mut senders = Vec::with_capacity(worker_len);
        let mut workers = Vec::with_capacity(worker_len);

        for _ in 0..worker_len {
            let (sender, receiver) = mpsc::unbounded_channel::<PoolJob>();
            senders.push(sender);
            let handle = thread::spawn(move || pool_worker_thread_main(receiver));
            workers.push(handle);
        }

        Self {
            worker_count,
            senders,
            workers,
        }
    }

    /// Returns the number of workers in this pool.
    #[must_use]
    pub fn worker_count(&self) -> u16 {
        self.worker_count
    }

    /// Returns the deterministic worker binding for one task id.
    #[must_use]
    pub fn bind_task(&self, task_id: u64) -> TaskAffinity {
        let worker_mod = task_id % u64::from(self.worker_count);
        let worker = u16::try_from(worker_mod).unwrap_or(0);
        TaskAffinity { task_id, worker }
    }

    /// Submits a job to the worker bound to `task_id`, without waiting for completion.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::Failed` when the worker queue is closed.
    pub fn submit(&self, task_id: u64, job: Box<dyn FnOnce() + Send>) -> DcpResult<()> {
        let affinity = self.bind_task(task_id);
        let sender = self
            .senders
            .get(usize::from(affinity.worker))
            .ok_or(DcpError::Failed("task pool worker is out of range"))?;
        sender
            .send(PoolJob { job, done: None })
            .map_err(|_| DcpError::Failed("task pool worker queue is closed"))
    }

    /// Submits a job and blocks until the bound worker finishes it.
    ///
    /// # Errors
    ///
    /// Returns `DcpError::Failed` when the worker queue or reply channel is closed.
    pub fn run_blocking(&self, task_id: u64, job: Box<dyn FnOnce() + Send>) -> DcpResult<()> {
        let affinity = self.bind_task(task_id);
        let sender = self
            .senders
            .get(usize::from(affinity.worker))
            .ok_or(DcpError::Failed("task pool worker is out of range"))?;
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        sender
            .send(PoolJob {
                job,
                done: Some(done_tx),
            })
            .map_err(|_| DcpError::Failed("task pool worker queue is closed"))?;
        done_rx
            .recv()
            .map_err(|_| DcpError::Failed("task pool reply channel is closed"))
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn pool_worker_thread_main(mut receiver: mpsc::UnboundedReceiver<PoolJob>) {
    let Ok(runtime) = TokioBuilder::new_current_thread().enable_time().build() else {
        return;
    };

    let local_set = LocalSet::new();
    runtime.block_on(local_set.run_until(async move {
        let mut processed_since_yield = 0_usize;
        while let Some(pool_job) = receiver.recv().await {
            let PoolJob { job, done } = pool_job;
            let _ = tokio::task::spawn_local(async move {
                job();
                if let Some(done) = done {
                    let _ = done.send(());
                }
            })
            .await;

            processed_since_yield = processed_since_yield.saturating_add(1);
            if processed_since_yield >= POOL_WORKER_YIELD_INTERVAL {
                processed_since_yield = 0;
                tokio::task::yield_now().await;
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::TaskPool;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[rstest]
    fn pool_binds_task_ids_to_stable_workers() {
        let pool = TaskPool::new(4);
        let first = pool.bind_task(42);
        let second = pool.bind_task(42);
        let third = pool.bind_task(43);

        assert_that!(&first, eq(&second));
        assert_that!(first.worker < pool.worker_count(), eq(true));
        assert_that!(third.worker < pool.worker_count(), eq(true));
    }

    #[rstest]
    fn blocking_jobs_execute_on_the_bound_worker() {
        let pool = TaskPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.run_blocking(
                7,
                Box::new(move || {
                    let _ = counter.fetch_add(1, Ordering::AcqRel);
                }),
            )
            .expect("job should reach the worker");
        }
        assert_that!(counter.load(Ordering::Acquire), eq(3_usize));
    }

    #[rstest]
    fn detached_jobs_drain_before_the_pool_drops() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = TaskPool::new(1);
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.submit(
                    1,
                    Box::new(move || {
                        let _ = counter.fetch_add(1, Ordering::AcqRel);
                    }),
                )
                .expect("job should enqueue");
            }
            // Dropping the pool joins the workers after their queues drain.
        }
        assert_that!(counter.load(Ordering::Acquire), eq(8_usize));
    }
}
