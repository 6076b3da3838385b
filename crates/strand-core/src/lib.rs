//! Strand Core
//!
//! A cooperative task runtime: suspended computations ("tasks") multiplexed
//! over a fixed pool of worker threads, with a `poll(2)` reactor turning
//! descriptor readiness into task wakeups.
//!
//! - [`sync`]: the transactional cell ([`Atom`]) every piece of cross-thread
//!   runtime state sits behind, and the spin lock it is built on
//! - [`scheduler`]: frames, tasks, wakers, join handles, the worker pool,
//!   the reactor and the [`Runtime`] that composes them
//!
//! ```ignore
//! let runtime = Runtime::with_workers(4)?;
//! let total = runtime.run(|handle| async move {
//!     let child = handle.spawn(async { 21 });
//!     child.await.map(|v| v * 2).unwrap_or(0)
//! })?;
//! ```

pub mod error;
pub mod scheduler;
pub mod sync;

pub use error::{fatal, JoinError, RuntimeError};
pub use scheduler::{
    create_waker, yield_now, Coro, FdWait, Handle, Interest, JoinHandle, Reactor, ReactorOptions,
    Ready, Runtime, RuntimeOptions, Task, TaskState, TaskTag, Waker, WorkerPool, YieldNow,
};
pub use sync::{Atom, SpinLock, Transaction};
