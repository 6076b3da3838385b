//! Fixed pool of worker threads draining one FIFO job queue
//!
//! Jobs are opaque closures. The runtime pushes one job per task resumption;
//! whichever idle worker pops it first runs it to completion before taking
//! the next one.

use crate::error::RuntimeError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of work for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Hook run on every worker thread before it starts taking jobs, with the
/// worker's index
pub type ThreadInit = Arc<dyn Fn(usize) + Send + Sync + 'static>;

/// Polls of `working` allowed for in-flight jobs during shutdown
const GRACE_LAPS: usize = 10;

/// Pause between grace-period polls
const GRACE_STEP: Duration = Duration::from_millis(5);

/// How long shutdown waits for each worker before detaching it
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

struct Queue {
    jobs: VecDeque<Job>,
    quit: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    /// Workers currently inside a job
    working: AtomicUsize,
}

/// Fixed set of OS threads sharing one FIFO job queue.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool of `size` workers. No thread runs until [`start`](Self::start).
    pub fn new(size: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    quit: false,
                }),
                available: Condvar::new(),
                working: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::with_capacity(size)),
            size,
        }
    }

    /// Spawn the worker threads, running `init` on each before its first job
    pub fn start(&self, init: ThreadInit) -> Result<(), RuntimeError> {
        let mut threads = self.threads.lock();
        for index in threads.len()..self.size {
            let shared = Arc::clone(&self.shared);
            let init = Arc::clone(&init);
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", index))
                .spawn(move || {
                    init(index);
                    Self::worker_loop(&shared);
                })
                .map_err(RuntimeError::WorkerSpawn)?;
            threads.push(handle);
        }
        tracing::debug!(workers = self.size, "worker pool started");
        Ok(())
    }

    /// Enqueue a job and wake one idle worker. After shutdown the job is
    /// dropped instead.
    pub fn push(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        if queue.quit {
            // Outside the lock: the job's destructors may push again
            drop(queue);
            drop(job);
            return;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Number of worker threads
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Workers currently running a job
    pub fn working(&self) -> usize {
        self.shared.working.load(Ordering::Acquire)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().quit
    }

    /// Stop every worker.
    ///
    /// In-flight jobs get a short grace period; workers that still have not
    /// exited after that are detached. Jobs left in the queue are dropped
    /// once the workers are gone. Calling this again is a no-op.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.quit {
                return;
            }
            queue.quit = true;
        }
        self.shared.available.notify_all();

        // A worker calling shutdown is itself "working"
        let own = usize::from(self.is_worker_thread());
        for _ in 0..GRACE_LAPS {
            if self.shared.working.load(Ordering::Acquire) <= own {
                break;
            }
            thread::sleep(GRACE_STEP);
        }

        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            Self::join_with_timeout(handle, JOIN_TIMEOUT);
        }

        let leftover = std::mem::take(&mut self.shared.queue.lock().jobs);
        if !leftover.is_empty() {
            tracing::debug!(jobs = leftover.len(), "dropping unstarted jobs");
        }
        drop(leftover);
    }

    fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.threads
            .lock()
            .iter()
            .any(|handle| handle.thread().id() == current)
    }

    /// Join a thread, giving up (and detaching it) after `timeout`
    fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
        let start = Instant::now();
        loop {
            if handle.is_finished() {
                let _ = handle.join();
                return;
            }
            if start.elapsed() > timeout {
                tracing::warn!(
                    thread = handle.thread().name().unwrap_or("?"),
                    "worker did not exit in time, detaching"
                );
                drop(handle);
                return;
            }
            thread::sleep(GRACE_STEP);
        }
    }

    fn worker_loop(shared: &Shared) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if queue.quit {
                        return;
                    }
                    if let Some(job) = queue.jobs.pop_front() {
                        break job;
                    }
                    shared.available.wait(&mut queue);
                }
            };

            shared.working.fetch_add(1, Ordering::AcqRel);
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                crate::fatal!(
                    "job panicked on {}",
                    thread::current().name().unwrap_or("worker")
                );
            }
            shared.working.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn noop_init() -> ThreadInit {
        Arc::new(|_| {})
    }

    #[test]
    fn test_runs_pushed_jobs() {
        let pool = WorkerPool::new(3);
        pool.start(noop_init()).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.push(Box::new(move || tx.send(i).unwrap()));
        }

        let mut seen: Vec<i32> = (0..20).map(|_| rx.recv().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
        pool.shutdown();
    }

    #[test]
    fn test_single_worker_is_fifo() {
        let pool = WorkerPool::new(1);
        pool.start(noop_init()).unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.push(Box::new(move || tx.send(i).unwrap()));
        }
        let order: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_threads_named_and_indexed() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        pool.start(Arc::new(move |index| {
            let name = thread::current().name().map(str::to_owned);
            tx.lock().send((index, name)).unwrap();
        }))
        .unwrap();

        let mut seen: Vec<_> = (0..2).map(|_| rx.recv().unwrap()).collect();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                (0, Some("strand-worker-0".to_string())),
                (1, Some("strand-worker-1".to_string())),
            ]
        );
    }

    #[test]
    fn test_shutdown_is_idempotent_and_drops_queue() {
        let pool = WorkerPool::new(1);
        pool.start(noop_init()).unwrap();

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        pool.push(Box::new(move || {
            let _ = gate_rx.recv_timeout(Duration::from_millis(20));
            done_tx.send(()).unwrap();
        }));

        let dropped = Arc::new(AtomicUsize::new(0));
        struct CountOnDrop(Arc<AtomicUsize>);
        impl Drop for CountOnDrop {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let marker = CountOnDrop(dropped.clone());
        pool.push(Box::new(move || drop(marker)));

        // Give the worker time to pick up the first job
        while pool.working() == 0 && pool.queued() == 2 {
            thread::yield_now();
        }

        pool.shutdown();
        pool.shutdown();
        drop(gate_tx);
        assert!(pool.is_shut_down());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
