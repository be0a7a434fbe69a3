// src/workers.rs
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::debug;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Per-worker queue depth. Submissions beyond this spill to the next
/// worker, then run inline on the submitter.
pub const QUEUE_CAPACITY: usize = 256;

/// Work-stealing worker pool.
///
/// Each worker owns a bounded queue; an idle worker scans its peers and
/// steals one task per attempt before blocking on its own queue again.
/// Submission is round-robin off a monotonic counter.
pub struct WorkerPool {
    senders: Vec<Sender<Task>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    num_workers: usize,

    submitted: AtomicU64,
    completed: Arc<AtomicU64>,
    steals_success: Arc<AtomicU64>,
    steals_failed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(num_workers: usize) -> Arc<Self> {
        let num_workers = if num_workers == 0 {
            num_cpus::get()
        } else {
            num_workers
        };

        let mut senders = Vec::with_capacity(num_workers);
        let mut receivers: Vec<Receiver<Task>> = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = bounded::<Task>(QUEUE_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }

        let completed = Arc::new(AtomicU64::new(0));
        let steals_success = Arc::new(AtomicU64::new(0));
        let steals_failed = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicBool::new(false));

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        let mut handles = Vec::with_capacity(num_workers);
        for id in 0..num_workers {
            let own = receivers[id].clone();
            let peers = receivers.clone();
            let completed = Arc::clone(&completed);
            let steals_success = Arc::clone(&steals_success);
            let steals_failed = Arc::clone(&steals_failed);
            let closed = Arc::clone(&closed);
            let core_id = (!core_ids.is_empty()).then(|| core_ids[id % core_ids.len()]);

            let handle = std::thread::Builder::new()
                .name(format!("ravel-worker-{}", id))
                .spawn(move || {
                    if let Some(core) = core_id {
                        if core_affinity::set_for_current(core) {
                            debug!(worker = id, core = core.id, "worker pinned");
                        }
                    }
                    worker_loop(
                        id,
                        own,
                        peers,
                        closed,
                        completed,
                        steals_success,
                        steals_failed,
                    );
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Arc::new(Self {
            senders,
            handles: Mutex::new(handles),
            closed,
            num_workers,
            submitted: AtomicU64::new(0),
            completed,
            steals_success,
            steals_failed,
        })
    }

    /// Submit a task. Target queue full → try the next queue once → run
    /// inline on the caller. Returns false only after shutdown.
    pub fn submit(&self, task: Task) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let n = self.submitted.fetch_add(1, Ordering::Relaxed);
        let idx = (n as usize) % self.num_workers;

        let task = match self.senders[idx].try_send(task) {
            Ok(()) => return true,
            Err(TrySendError::Full(t)) | Err(TrySendError::Disconnected(t)) => t,
        };

        let next = (idx + 1) % self.num_workers;
        let task = match self.senders[next].try_send(task) {
            Ok(()) => return true,
            Err(TrySendError::Full(t)) | Err(TrySendError::Disconnected(t)) => t,
        };

        // Every queue we tried is full: execute inline on the submitter.
        task();
        self.completed.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let submitted = self.submitted.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        WorkerPoolStats {
            num_workers: self.num_workers,
            tasks_submitted: submitted,
            tasks_completed: completed,
            tasks_pending: submitted.saturating_sub(completed),
            steals_success: self.steals_success.load(Ordering::Relaxed),
            steals_failed: self.steals_failed.load(Ordering::Relaxed),
        }
    }

    /// Stop intake and join the workers. Queued and in-flight tasks run to
    /// completion first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    id: usize,
    own: Receiver<Task>,
    peers: Vec<Receiver<Task>>,
    closed: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
    steals_success: Arc<AtomicU64>,
    steals_failed: Arc<AtomicU64>,
) {
    let num_workers = peers.len();

    loop {
        // Drain own queue first.
        if let Ok(task) = own.try_recv() {
            task();
            completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        // Own queue empty: scan the other workers, one steal per attempt.
        let mut stole = false;
        for offset in 1..num_workers {
            let victim = (id + offset) % num_workers;
            if let Ok(task) = peers[victim].try_recv() {
                steals_success.fetch_add(1, Ordering::Relaxed);
                task();
                completed.fetch_add(1, Ordering::Relaxed);
                stole = true;
                break;
            }
        }
        if stole {
            continue;
        }
        if num_workers > 1 {
            steals_failed.fetch_add(1, Ordering::Relaxed);
        }

        // Exit only once intake has stopped and every queue is drained, so
        // in-flight work always completes.
        if closed.load(Ordering::Acquire) {
            return;
        }

        // Nothing anywhere: block on own queue. The timeout bounds how
        // long shutdown waits for an idle worker.
        match own.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => {
                task();
                completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub num_workers: usize,
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_pending: u64,
    pub steals_success: u64,
    pub steals_failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_submit_and_complete() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let c = Arc::clone(&counter);
            assert!(pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 100 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(Duration::from_millis(5));
        }

        let stats = pool.stats();
        assert_eq!(stats.tasks_submitted, 100);
    }

    #[test]
    fn test_full_queues_run_inline() {
        // One worker kept busy so its queue backs up; submissions past
        // capacity must still run (inline) rather than be dropped.
        let pool = WorkerPool::new(1);
        let gate = Arc::new(AtomicBool::new(false));

        let g = Arc::clone(&gate);
        pool.submit(Box::new(move || {
            while !g.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }));

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..(QUEUE_CAPACITY + 50) {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // The overflow portion already ran inline on this thread.
        assert!(counter.load(Ordering::SeqCst) >= 50);
        gate.store(true, Ordering::Release);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < QUEUE_CAPACITY + 50 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_stealing_happens() {
        // Saturate worker 0's queue while worker 1 sits idle; worker 1
        // should pull from its peer.
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..200 {
            let c = Arc::clone(&counter);
            pool.submit(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(100));
            }));
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::SeqCst) < 200 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_submit_after_close_refused() {
        let pool = WorkerPool::new(2);
        pool.close();
        assert!(!pool.submit(Box::new(|| {})));
    }
}
