//! Cooperative mutex for critical sections that span suspension points
//!
//! Waiting tasks park instead of spinning and are handed the lock directly,
//! in arrival order. A waiter whose task was killed while queued is skipped.

use crossbeam::atomic::AtomicCell;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use strand_core::{Atom, Waker};

/// Arrival number of a lock attempt
type Ticket = u64;

struct Queue {
    locked: bool,
    next_ticket: Ticket,
    waiters: VecDeque<(Ticket, Waker)>,
}

/// Task-aware mutex: `lock().await` parks the task, not the thread.
pub struct AsyncMutex<T> {
    queue: Atom<Queue>,

    /// Ticket the lock was handed to, until that waiter picks it up
    granted: AtomicCell<Option<Ticket>>,

    data: UnsafeCell<T>,
}

// Access to `data` is serialised by the lock protocol
unsafe impl<T: Send> Send for AsyncMutex<T> {}
unsafe impl<T: Send> Sync for AsyncMutex<T> {}

impl<T> AsyncMutex<T> {
    /// Create an unlocked mutex
    pub fn new(value: T) -> Self {
        Self {
            queue: Atom::new(Queue {
                locked: false,
                next_ticket: 0,
                waiters: VecDeque::new(),
            }),
            granted: AtomicCell::new(None),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, parking the calling task while it is held
    pub fn lock(&self) -> Lock<'_, T> {
        Lock {
            mutex: self,
            ticket: None,
        }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<AsyncMutexGuard<'_, T>> {
        let mut queue = self.queue.acquire();
        if queue.locked {
            return None;
        }
        queue.locked = true;
        Some(AsyncMutexGuard::new(self))
    }

    /// Whether some task holds (or has been handed) the lock
    pub fn is_locked(&self) -> bool {
        self.queue.acquire().locked
    }

    /// Tasks parked waiting for the lock
    pub fn waiting(&self) -> usize {
        self.queue.acquire().waiters.len()
    }

    /// Consume the mutex and return the data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Pass the lock to the first live waiter, or free it
    fn unlock(&self) {
        let mut skipped = Vec::new();
        let next = {
            let mut queue = self.queue.acquire();
            loop {
                match queue.waiters.pop_front() {
                    Some((_, waker)) if waker.is_cancelled() => skipped.push(waker),
                    Some((ticket, waker)) => {
                        self.granted.store(Some(ticket));
                        break Some(waker);
                    }
                    None => {
                        queue.locked = false;
                        break None;
                    }
                }
            }
        };
        drop(skipped);
        if let Some(mut waker) = next {
            waker.wake();
        }
    }
}

impl<T: Default> Default for AsyncMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for AsyncMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMutex")
            .field("locked", &self.is_locked())
            .field("waiting", &self.waiting())
            .finish()
    }
}

/// Future returned by [`AsyncMutex::lock`]
pub struct Lock<'a, T> {
    mutex: &'a AsyncMutex<T>,
    /// Set once the attempt is queued
    ticket: Option<Ticket>,
}

impl<'a, T> Future for Lock<'a, T> {
    type Output = AsyncMutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mutex = this.mutex;
        let mut queue = mutex.queue.acquire();

        match this.ticket {
            None if !queue.locked => {
                queue.locked = true;
                Poll::Ready(AsyncMutexGuard::new(mutex))
            }
            Some(ticket) if mutex.granted.load() == Some(ticket) => {
                mutex.granted.store(None);
                this.ticket = None;
                Poll::Ready(AsyncMutexGuard::new(mutex))
            }
            _ => {
                let ticket = match this.ticket {
                    Some(ticket) => ticket,
                    None => {
                        let ticket = queue.next_ticket;
                        queue.next_ticket += 1;
                        this.ticket = Some(ticket);
                        ticket
                    }
                };
                queue
                    .waiters
                    .push_back((ticket, strand_core::create_waker()));
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for Lock<'_, T> {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket else {
            return;
        };
        if self.mutex.granted.load() == Some(ticket) {
            // Handed the lock but never picked it up: pass it on
            self.mutex.granted.store(None);
            self.mutex.unlock();
            return;
        }
        let removed = {
            let mut queue = self.mutex.queue.acquire();
            queue
                .waiters
                .iter()
                .position(|(queued, _)| *queued == ticket)
                .and_then(|index| queue.waiters.remove(index))
        };
        drop(removed);
    }
}

impl<T> fmt::Debug for Lock<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("ticket", &self.ticket).finish()
    }
}

/// Exclusive access to an [`AsyncMutex`]'s data; unlocks on drop.
pub struct AsyncMutexGuard<'a, T> {
    mutex: &'a AsyncMutex<T>,
    _data: PhantomData<&'a mut T>,
}

impl<'a, T> AsyncMutexGuard<'a, T> {
    fn new(mutex: &'a AsyncMutex<T>) -> Self {
        Self {
            mutex,
            _data: PhantomData,
        }
    }
}

impl<T> Deref for AsyncMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard is the lock holder
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for AsyncMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard is the lock holder
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for AsyncMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for AsyncMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
