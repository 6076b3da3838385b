//! Readiness reactor over `poll(2)`
//!
//! Tasks waiting for a descriptor park a [`Waker`] in the reactor's table.
//! The run loop calls [`Reactor::poll`] between short sleeps; every entry the
//! kernel reports as ready (or hung up, or invalid) has its waker invoked and
//! its slot freed. Every few laps the table is swept for entries whose task
//! was killed in the meantime, and shrunk when it has become mostly empty.

use super::runtime::Handle;
use super::task::Waker;
use crate::error::RuntimeError;
use crate::sync::Atom;
use std::fmt;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Events a waiter cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// Wake when the descriptor is readable
    pub read: bool,
    /// Wake when the descriptor is writable
    pub write: bool,
}

impl Interest {
    /// Readable only
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };

    /// Writable only
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };

    /// Readable or writable
    pub const BOTH: Interest = Interest {
        read: true,
        write: true,
    };

    /// `poll(2)` event mask. Hangup is always included.
    fn events(self) -> libc::c_short {
        let mut events = libc::POLLHUP;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// A parked wait on a descriptor.
#[derive(Debug)]
pub struct FdWait {
    /// Descriptor to watch
    pub fd: RawFd,
    /// Events to watch for
    pub interest: Interest,
    /// Invoked (once) when the descriptor becomes ready
    pub waker: Waker,
}

/// Reactor tuning knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactorOptions {
    /// Slots allocated up front
    pub initial_capacity: usize,

    /// Polls between sweeps for killed waiters (and compaction checks)
    pub sweep_interval: u64,

    /// The table never shrinks below this many slots
    pub compaction_floor: usize,
}

impl Default for ReactorOptions {
    fn default() -> Self {
        Self {
            initial_capacity: 64,
            sweep_interval: 50,
            compaction_floor: 64,
        }
    }
}

impl ReactorOptions {
    /// Check the options for values the reactor cannot work with
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.initial_capacity == 0 {
            return Err(RuntimeError::InvalidOption(
                "reactor initial_capacity must be at least 1".into(),
            ));
        }
        if self.sweep_interval == 0 {
            return Err(RuntimeError::InvalidOption(
                "reactor sweep_interval must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

const FREE_SLOT: libc::pollfd = libc::pollfd {
    fd: -1,
    events: 0,
    revents: 0,
};

struct Table {
    /// Passed to `poll(2)` as is; free slots have a negative fd, which the
    /// kernel skips
    pollfds: Vec<libc::pollfd>,
    entries: Vec<Option<FdWait>>,
    used: usize,
    laps: u64,
    max_fds: usize,
}

impl Table {
    fn with_capacity(capacity: usize, max_fds: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            pollfds: vec![FREE_SLOT; capacity],
            entries,
            used: 0,
            laps: 0,
            max_fds,
        }
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, wait: FdWait) {
        let index = match self.entries.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                let index = self.capacity();
                self.grow();
                index
            }
        };
        self.pollfds[index] = libc::pollfd {
            fd: wait.fd,
            events: wait.interest.events(),
            revents: 0,
        };
        self.entries[index] = Some(wait);
        self.used += 1;
    }

    fn remove(&mut self, index: usize) -> Option<FdWait> {
        let wait = self.entries[index].take()?;
        self.pollfds[index] = FREE_SLOT;
        self.used -= 1;
        Some(wait)
    }

    fn grow(&mut self) {
        let prev = self.capacity();
        let Some(next) = next_capacity(prev, self.max_fds) else {
            crate::fatal!("reactor table full: {} waiters at the descriptor limit", prev);
        };
        self.pollfds.resize(next, FREE_SLOT);
        self.entries.resize_with(next, || None);
        tracing::trace!(from = prev, to = next, "reactor table grown");
    }

    /// Move live entries to the front and shrink to `capacity`
    fn compact(&mut self, capacity: usize) {
        let mut table = Table::with_capacity(capacity, self.max_fds);
        table.laps = self.laps;
        for index in 0..self.capacity() {
            if let Some(wait) = self.remove(index) {
                table.insert(wait);
            }
        }
        tracing::trace!(from = self.capacity(), to = capacity, "reactor table compacted");
        *self = table;
    }
}

/// Grow by half, by at least one, never past `max_fds`. `None` at the limit.
fn next_capacity(prev: usize, max_fds: usize) -> Option<usize> {
    if prev >= max_fds {
        return None;
    }
    Some((prev + prev / 2).max(prev + 1).min(max_fds))
}

/// `poll(2)`-backed table of descriptor waiters.
pub struct Reactor {
    table: Atom<Table>,
    options: ReactorOptions,
}

impl Reactor {
    /// Create a reactor; fails if the descriptor limit cannot be queried
    pub fn new(options: ReactorOptions) -> Result<Self, RuntimeError> {
        options.validate()?;
        let max_fds = descriptor_limit()?;
        let capacity = options.initial_capacity.min(max_fds.max(1));
        Ok(Self {
            table: Atom::new(Table::with_capacity(capacity, max_fds)),
            options,
        })
    }

    /// Park `wait` until its descriptor becomes ready
    pub fn insert(&self, wait: FdWait) {
        self.table.acquire().insert(wait);
    }

    /// Number of parked waiters
    pub fn len(&self) -> usize {
        self.table.acquire().used
    }

    /// Whether no waiter is parked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots in the table
    pub fn capacity(&self) -> usize {
        self.table.acquire().capacity()
    }

    /// Options the reactor was built with
    pub fn options(&self) -> &ReactorOptions {
        &self.options
    }

    /// Drop every parked waiter, killing its task
    pub fn clear(&self) {
        let mut dropped = Vec::new();
        {
            let mut table = self.table.acquire();
            for index in 0..table.capacity() {
                if let Some(wait) = table.remove(index) {
                    dropped.push(wait);
                }
            }
        }
        drop(dropped);
    }

    /// Run one zero-timeout `poll(2)` and wake every ready waiter.
    ///
    /// Returns the number of waiters woken. An interrupted poll counts as no
    /// events; any other failure of the call is fatal.
    pub fn poll(&self) -> usize {
        let mut ready = Vec::new();
        let mut swept = Vec::new();
        {
            let mut table = self.table.acquire();
            table.laps += 1;

            if table.used > 0 {
                let nfds = table.pollfds.len() as libc::nfds_t;
                // SAFETY: the pointer and length describe `table.pollfds`,
                // which the transaction keeps alive and unaliased
                let rc = unsafe { libc::poll(table.pollfds.as_mut_ptr(), nfds, 0) };
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        crate::fatal!("poll(2) failed: {}", err);
                    }
                } else if rc > 0 {
                    for index in 0..table.capacity() {
                        if table.pollfds[index].revents != 0 {
                            if let Some(wait) = table.remove(index) {
                                ready.push(wait.waker);
                            }
                        }
                    }
                }
            }

            if table.laps % self.options.sweep_interval == 0 {
                for index in 0..table.capacity() {
                    let cancelled = table.entries[index]
                        .as_ref()
                        .is_some_and(|wait| wait.waker.is_cancelled());
                    if cancelled {
                        if let Some(wait) = table.remove(index) {
                            swept.push(wait.waker);
                        }
                    }
                }

                let capacity = table.capacity();
                let floor = self.options.compaction_floor;
                if table.used < capacity / 2 && capacity > floor {
                    table.compact(floor.max(capacity * 7 / 10));
                }
            }
        }

        if !swept.is_empty() {
            tracing::trace!(count = swept.len(), "swept killed waiters");
        }
        let woken = ready.len();
        for mut waker in ready.into_iter().chain(swept) {
            waker.wake();
        }
        woken
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.table.acquire();
        f.debug_struct("Reactor")
            .field("used", &table.used)
            .field("capacity", &table.capacity())
            .field("laps", &table.laps)
            .finish()
    }
}

/// Soft `RLIMIT_NOFILE`
fn descriptor_limit() -> Result<usize, RuntimeError> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid out-pointer for the duration of the call
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return Err(RuntimeError::DescriptorLimit(io::Error::last_os_error()));
    }
    Ok(usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX))
}

/// Zero-timeout readiness check of a single descriptor
pub(crate) fn probe(fd: RawFd, interest: Interest) -> bool {
    let mut pollfd = libc::pollfd {
        fd,
        events: interest.events(),
        revents: 0,
    };
    // SAFETY: one valid pollfd on the stack
    let rc = unsafe { libc::poll(&mut pollfd, 1, 0) };
    rc > 0 && pollfd.revents != 0
}

// ============================================================================
// Ready future
// ============================================================================

/// Resolves once `fd` is ready for `interest` (or hung up, or invalid).
#[derive(Debug)]
pub struct Ready {
    handle: Handle,
    fd: RawFd,
    interest: Interest,
    parked: bool,
}

impl Ready {
    pub(crate) fn new(handle: Handle, fd: RawFd, interest: Interest) -> Self {
        Self {
            handle,
            fd,
            interest,
            parked: false,
        }
    }
}

impl Future for Ready {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.parked || probe(this.fd, this.interest) {
            return Poll::Ready(());
        }
        let waker = this.handle.create_waker();
        this.handle.reactor().insert(FdWait {
            fd: this.fd,
            interest: this.interest,
            waker,
        });
        this.parked = true;
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::{Task, TaskRecord};
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::Weak;

    fn detached_waker() -> (Waker, std::sync::Arc<TaskRecord>) {
        let record = TaskRecord::new(Weak::new());
        (Waker::new(Task::new(record.clone())), record)
    }

    #[test]
    fn test_interest_events() {
        assert_eq!(Interest::READ.events(), libc::POLLHUP | libc::POLLIN);
        assert_eq!(Interest::WRITE.events(), libc::POLLHUP | libc::POLLOUT);
        assert_eq!(
            Interest::BOTH.events(),
            libc::POLLHUP | libc::POLLIN | libc::POLLOUT
        );
    }

    #[test]
    fn test_options_validate() {
        assert!(ReactorOptions::default().validate().is_ok());
        let bad = ReactorOptions {
            sweep_interval: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_ready_entry_removed_on_poll() {
        let reactor = Reactor::new(ReactorOptions::default()).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        let (waker, record) = detached_waker();
        reactor.insert(FdWait {
            fd: b.as_raw_fd(),
            interest: Interest::READ,
            waker,
        });
        assert_eq!(reactor.len(), 1);
        assert_eq!(reactor.poll(), 0);
        assert_eq!(reactor.len(), 1);

        a.write_all(b"x").unwrap();
        assert_eq!(reactor.poll(), 1);
        assert!(reactor.is_empty());
        // Woken without a runtime: the task is dropped
        assert!(record.is_killed());
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let options = ReactorOptions {
            initial_capacity: 4,
            sweep_interval: 1000,
            compaction_floor: 4,
        };
        let reactor = Reactor::new(options).unwrap();
        let pairs: Vec<_> = (0..10).map(|_| UnixStream::pair().unwrap()).collect();
        for (_, b) in &pairs {
            reactor.insert(FdWait {
                fd: b.as_raw_fd(),
                interest: Interest::READ,
                waker: detached_waker().0,
            });
        }
        assert_eq!(reactor.len(), 10);
        assert!(reactor.capacity() >= 10);
        reactor.clear();
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_growth_capped_by_descriptor_limit() {
        assert_eq!(next_capacity(64, 1024), Some(96));
        assert_eq!(next_capacity(1, 1024), Some(2));
        assert_eq!(next_capacity(900, 1024), Some(1024));
        assert_eq!(next_capacity(1023, 1024), Some(1024));
        assert_eq!(next_capacity(1024, 1024), None);

        let mut table = Table::with_capacity(2, 3);
        table.grow();
        assert_eq!(table.capacity(), 3);
    }

    #[test]
    fn test_sweep_evicts_killed_and_compacts() {
        let options = ReactorOptions {
            initial_capacity: 8,
            sweep_interval: 2,
            compaction_floor: 8,
        };
        let reactor = Reactor::new(options).unwrap();
        let pairs: Vec<_> = (0..40).map(|_| UnixStream::pair().unwrap()).collect();
        let mut records = Vec::new();
        for (_, b) in &pairs {
            let (waker, record) = detached_waker();
            reactor.insert(FdWait {
                fd: b.as_raw_fd(),
                interest: Interest::READ,
                waker,
            });
            records.push(record);
        }
        let grown = reactor.capacity();
        assert!(grown >= 40);

        // Kill all but one waiter; they stay until the sweep lap
        for record in &records[1..] {
            record.kill();
        }
        reactor.poll();
        assert_eq!(reactor.len(), 40);
        reactor.poll();
        assert_eq!(reactor.len(), 1);
        assert!(reactor.capacity() < grown);
        assert!(reactor.capacity() >= 8);
        assert!(!records[0].is_killed());
    }

    #[test]
    fn test_probe() {
        let (mut a, b) = UnixStream::pair().unwrap();
        assert!(!probe(b.as_raw_fd(), Interest::READ));
        assert!(probe(b.as_raw_fd(), Interest::WRITE));
        a.write_all(b"ping").unwrap();
        assert!(probe(b.as_raw_fd(), Interest::READ));
    }
}
