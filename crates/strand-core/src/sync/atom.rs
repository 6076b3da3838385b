//! Transactional cell: a payload reachable only while its lock is held
//!
//! Every piece of cross-thread runtime state (worker slots, reactor table,
//! task records) lives in an [`Atom`]. The payload has no accessor other than
//! a [`Transaction`], so touching it without holding the lock does not
//! compile.

use super::SpinLock;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

/// Payload guarded by an exclusive lock.
pub struct Atom<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

// The lock serialises every access to `data`.
unsafe impl<T: Send> Send for Atom<T> {}
unsafe impl<T: Send> Sync for Atom<T> {}

impl<T> Atom<T> {
    /// Wrap a value
    pub const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Lock the cell, blocking the calling thread while another thread holds it.
    ///
    /// Acquiring a cell the calling thread already holds is fatal.
    #[track_caller]
    pub fn acquire(&self) -> Transaction<'_, T> {
        self.lock.lock();
        Transaction::new(self)
    }

    /// Lock the cell if nobody (the calling thread included) holds it
    pub fn try_acquire(&self) -> Option<Transaction<'_, T>> {
        if self.lock.try_lock() {
            Some(Transaction::new(self))
        } else {
            None
        }
    }

    /// Run `f` inside a transaction and return its result
    #[track_caller]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut tx = self.acquire();
        f(&mut tx)
    }

    /// Whether some thread is inside a transaction right now
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Consume the cell and return the payload
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Mutable access without locking; `&mut self` already proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Atom<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Atom<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("locked", &self.lock.is_locked())
            .finish_non_exhaustive()
    }
}

/// Scope-bound exclusive access to an [`Atom`]'s payload.
///
/// Unlocks on drop, including during unwinding. Not `Send`: the lock records
/// the acquiring thread, so the transaction must end on that thread.
pub struct Transaction<'a, T> {
    atom: &'a Atom<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> Transaction<'a, T> {
    fn new(atom: &'a Atom<T>) -> Self {
        Self {
            atom,
            _not_send: PhantomData,
        }
    }

    /// End the transaction before the end of its scope
    pub fn release(self) {
        drop(self);
    }
}

impl<T> Deref for Transaction<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the transaction exists only while the lock is held
        unsafe { &*self.atom.data.get() }
    }
}

impl<T> DerefMut for Transaction<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing through this transaction
        unsafe { &mut *self.atom.data.get() }
    }
}

impl<T> Drop for Transaction<'_, T> {
    fn drop(&mut self) {
        self.atom.lock.unlock();
    }
}

impl<T: fmt::Debug> fmt::Debug for Transaction<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Transaction").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_and_mutate() {
        let atom = Atom::new(vec![1, 2]);
        {
            let mut tx = atom.acquire();
            tx.push(3);
            assert!(atom.is_locked());
        }
        assert!(!atom.is_locked());
        assert_eq!(atom.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_try_acquire_contested() {
        let atom = Atom::new(0u32);
        let tx = atom.acquire();
        assert!(atom.try_acquire().is_none());
        tx.release();

        let mut tx = atom.try_acquire().expect("uncontested");
        *tx += 1;
        drop(tx);
        assert_eq!(atom.with(|v| *v), 1);
    }

    #[test]
    fn test_release_unlocks_early() {
        let atom = Atom::new(String::from("a"));
        let mut tx = atom.acquire();
        tx.push('b');
        tx.release();
        assert!(!atom.is_locked());
        assert_eq!(atom.with(|s| s.clone()), "ab");
    }

    #[test]
    fn test_unlocked_after_panic() {
        let atom = Arc::new(Atom::new(0));
        let inner = atom.clone();
        let result = thread::spawn(move || {
            let _tx = inner.acquire();
            panic!("inside a transaction");
        })
        .join();
        assert!(result.is_err());
        assert!(!atom.is_locked());
    }

    #[test]
    fn test_concurrent_increments() {
        let atom = Arc::new(Atom::new(0usize));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let atom = atom.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        atom.with(|v| *v += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(atom.with(|v| *v), 4000);
    }

    #[test]
    fn test_get_mut() {
        let mut atom = Atom::new(1);
        *atom.get_mut() = 5;
        assert_eq!(atom.with(|v| *v), 5);
    }
}
