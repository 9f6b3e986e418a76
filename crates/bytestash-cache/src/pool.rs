//! Deferred-execution pool for shrink-triggered eviction.
//!
//! A single worker thread drains a FIFO of jobs. The pending count
//! (queued plus executing) is observable for callers that need to
//! assert on scheduled work, `drain` blocks until the pool is idle,
//! and shutdown finishes the remaining queue before joining.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    active: usize,
    stopped: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    // Queued plus executing, readable without taking the pool mutex.
    pending: AtomicUsize,
    work_ready: Condvar,
    idle: Condvar,
}

/// Background worker owned by the cache for deferred eviction.
pub(crate) struct EvictionPool {
    shared: Arc<PoolShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionPool {
    pub(crate) fn new() -> std::io::Result<Self> {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            pending: AtomicUsize::new(0),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("bytestash-evict".to_owned())
            .spawn(move || worker_loop(&worker))?;
        Ok(Self {
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    /// Enqueue a job. Jobs submitted after shutdown are dropped.
    pub(crate) fn execute(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            trace!(target: "stash::pool", event = "job_rejected_after_stop");
            return;
        }
        state.queue.push_back(job);
        let pending = self.shared.pending.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(target: "stash::pool", event = "job_queued", pending);
        drop(state);
        self.shared.work_ready.notify_one();
    }

    /// Jobs queued or currently executing. Lock-free.
    pub(crate) fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Block until the queue is empty and the worker is idle.
    pub(crate) fn drain(&self) {
        let mut state = self.shared.state.lock();
        while state.active > 0 || !state.queue.is_empty() {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Finish the remaining queue, stop the worker, and join it.
    ///
    /// Idempotent; also invoked from `Drop`.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.stopped = true;
        }
        self.shared.work_ready.notify_all();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

impl Drop for EvictionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break Some(job);
                }
                if state.stopped {
                    break None;
                }
                shared.work_ready.wait(&mut state);
            }
        };
        let Some(job) = job else {
            return;
        };
        job();
        let mut state = shared.state.lock();
        state.active -= 1;
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        if state.active == 0 && state.queue.is_empty() {
            shared.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn runs_jobs_in_submission_order() {
        let pool = EvictionPool::new().expect("pool");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let order = Arc::clone(&order);
            pool.execute(Box::new(move || order.lock().push(i)));
        }
        pool.drain();
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn pending_counts_queued_and_active_jobs() {
        let pool = EvictionPool::new().expect("pool");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();

        pool.execute(Box::new(move || {
            started_tx.send(()).ok();
            gate_rx.recv().ok();
        }));
        started_rx.recv().expect("worker picked up the gate job");

        // The gate job is executing; one more sits queued behind it.
        pool.execute(Box::new(|| {}));
        assert_eq!(pool.pending(), 2);

        gate_tx.send(()).expect("release gate");
        pool.drain();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn drain_returns_immediately_when_idle() {
        let pool = EvictionPool::new().expect("pool");
        pool.drain();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn shutdown_finishes_remaining_queue() {
        let pool = EvictionPool::new().expect("pool");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            pool.execute(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 8);

        // Submissions after shutdown are dropped.
        let ran_after = Arc::clone(&ran);
        pool.execute(Box::new(move || {
            ran_after.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
