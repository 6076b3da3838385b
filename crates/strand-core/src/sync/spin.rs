//! General-purpose exclusive lock with self-deadlock detection
//!
//! Spins (with backoff) instead of parking the thread, so it is only meant
//! for short critical sections. Anything held across a suspension point
//! needs a cooperative lock that parks tasks instead.

use crossbeam::utils::Backoff;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Holder tag meaning "nobody".
const NO_HOLDER: u64 = 0;

static NEXT_THREAD_TAG: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TAG: Cell<u64> = const { Cell::new(NO_HOLDER) };
}

/// Process-unique tag of the calling thread, assigned on first use.
pub(crate) fn thread_tag() -> u64 {
    THREAD_TAG.with(|tag| {
        if tag.get() == NO_HOLDER {
            tag.set(NEXT_THREAD_TAG.fetch_add(1, Ordering::Relaxed));
        }
        tag.get()
    })
}

/// Spin-based exclusive lock that refuses re-locking by its holder.
pub struct SpinLock {
    locked: AtomicBool,

    /// Tag of the holding thread (only ever equal to the caller's own tag
    /// if the caller holds the lock)
    holder: AtomicU64,
}

impl SpinLock {
    /// Create an unlocked lock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(NO_HOLDER),
        }
    }

    /// Block the calling thread until the lock is acquired.
    ///
    /// Locking twice from the same thread would spin forever, so it aborts
    /// the process instead.
    #[track_caller]
    pub fn lock(&self) {
        let me = thread_tag();
        if self.holder.load(Ordering::Relaxed) == me {
            crate::fatal!("deadlock detected: thread re-locked a spin lock it already holds");
        }

        let backoff = Backoff::new();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff.snooze();
        }
        self.holder.store(me, Ordering::Relaxed);
    }

    /// Try to acquire without blocking. Returns `false` if the lock is held
    /// by anyone, the calling thread included.
    pub fn try_lock(&self) -> bool {
        let acquired = self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        if acquired {
            self.holder.store(thread_tag(), Ordering::Relaxed);
        }
        acquired
    }

    /// Release the lock. Must only be called by the holder.
    pub fn unlock(&self) {
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }

    /// Whether some thread currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Whether the calling thread holds the lock
    pub fn is_held_by_current_thread(&self) -> bool {
        self.holder.load(Ordering::Relaxed) == thread_tag()
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}
