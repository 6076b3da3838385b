//! Timer thread and the `Sleep` future
//!
//! One thread per [`TimerService`] waits on a condvar for the earliest
//! deadline in a min-heap of parked wakers, then wakes everything that is due.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strand_core::Waker;

/// Entry in the timer heap
struct SleepEntry {
    wake_at: Instant,
    /// Insertion order, so equal deadlines fire first-come first-served
    seq: u64,
    waker: Waker,
}

// Reverse ordering for min-heap (earliest wake time first)
impl Ord for SleepEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for SleepEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SleepEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for SleepEntry {}

struct TimerState {
    sleeping: BinaryHeap<SleepEntry>,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<TimerState>,
    notify: Condvar,
    shutdown: AtomicBool,
}

impl TimerShared {
    fn register(&self, wake_at: Instant, waker: Waker) {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.sleeping.push(SleepEntry {
            wake_at,
            seq,
            waker,
        });
        drop(state);
        // The new entry may be earlier than the one the thread waits for
        self.notify.notify_one();
    }

    fn run_loop(&self) {
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut due = Vec::new();
            {
                let mut state = self.state.lock();
                // stop() may have run between the check above and the lock
                if self.shutdown.load(AtomicOrdering::Acquire) {
                    break;
                }

                let now = Instant::now();
                while state.sleeping.peek().is_some_and(|entry| entry.wake_at <= now) {
                    if let Some(entry) = state.sleeping.pop() {
                        due.push(entry.waker);
                    }
                }

                if due.is_empty() {
                    match state.sleeping.peek().map(|entry| entry.wake_at) {
                        Some(wake_at) => {
                            let now = Instant::now();
                            if wake_at > now {
                                self.notify.wait_for(&mut state, wake_at - now);
                            }
                        }
                        None => self.notify.wait(&mut state),
                    }
                }
            }

            for mut waker in due {
                waker.wake();
            }
        }

        tracing::debug!("timer thread shutting down");
    }
}

/// Timer thread parking wakers until their deadline.
pub struct TimerService {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Start a timer thread
    pub fn start() -> io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                sleeping: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let timer = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("strand-timer".to_string())
            .spawn(move || timer.run_loop())?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Wake `waker` once `wake_at` has passed
    pub fn register(&self, wake_at: Instant, waker: Waker) {
        self.shared.register(wake_at, waker);
    }

    /// Future resolving `duration` from now
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(Arc::clone(&self.shared), duration)
    }

    /// Number of parked wakers
    pub fn pending(&self) -> usize {
        self.shared.state.lock().sleeping.len()
    }

    /// Stop the timer thread. Parked wakers are dropped, killing their tasks.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::Release);
        self.shared.notify.notify_one();

        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                if start.elapsed() > timeout {
                    tracing::warn!("timer thread did not exit in time, detaching");
                    drop(handle);
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        let parked = std::mem::take(&mut self.shared.state.lock().sleeping);
        drop(parked);
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.stop();
    }
}

static GLOBAL_TIMER: OnceLock<TimerService> = OnceLock::new();

/// Process-wide timer service, started on first use
pub fn global_timer() -> &'static TimerService {
    GLOBAL_TIMER.get_or_init(|| match TimerService::start() {
        Ok(service) => service,
        Err(err) => strand_core::fatal!("failed to start the timer thread: {}", err),
    })
}

/// Suspend the calling task for `duration` on the process-wide timer
pub fn sleep(duration: Duration) -> Sleep {
    global_timer().sleep(duration)
}

/// Resolves once its deadline has passed. Parks at most one waker per arming.
pub struct Sleep {
    timer: Arc<TimerShared>,
    deadline: Instant,
    armed: bool,
}

impl Sleep {
    fn new(timer: Arc<TimerShared>, duration: Duration) -> Self {
        Self {
            timer,
            deadline: Instant::now() + duration,
            armed: false,
        }
    }

    /// When the sleep resolves
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Re-arm to fire `duration` from now
    pub fn reset(&mut self, duration: Duration) {
        self.deadline = Instant::now() + duration;
        self.armed = false;
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        // Armed sleeps are only resumed by the timer, after the deadline
        if this.armed || Instant::now() >= this.deadline {
            this.armed = false;
            return Poll::Ready(());
        }
        this.timer.register(this.deadline, strand_core::create_waker());
        this.armed = true;
        Poll::Pending
    }
}

impl std::fmt::Debug for Sleep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("armed", &self.armed)
            .finish()
    }
}
