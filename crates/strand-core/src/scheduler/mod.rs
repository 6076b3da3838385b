//! Task scheduler
//!
//! Tasks are resumed by jobs on a fixed worker pool. A task that cannot make
//! progress hands itself to a [`Waker`] and stays off the queue until the
//! waker is woken; the [`Reactor`] does this for descriptor readiness.

mod frame;
mod options;
mod pool;
mod reactor;
mod runtime;
mod task;

pub use frame::Coro;
pub use options::{
    RuntimeOptions, ENV_POLL_INTERVAL_MS, ENV_REACTOR_CAPACITY, ENV_SWEEP_INTERVAL,
    ENV_WORKER_THREADS,
};
pub use pool::{Job, ThreadInit, WorkerPool};
pub use reactor::{FdWait, Interest, Reactor, ReactorOptions, Ready};
pub use runtime::{create_waker, yield_now, Handle, Runtime, YieldNow};
pub use task::{JoinHandle, Task, TaskState, TaskTag, Waker};
