//! Runtime: the composition root
//!
//! Owns the worker pool, the reactor, one task slot per worker and the
//! alive-task counter. [`Runtime::run`] drives the reactor from the calling
//! thread until every task has been retired.

use super::frame::{Coro, FrameChain, FrameRecord, Resume, Step};
use super::options::RuntimeOptions;
use super::pool::WorkerPool;
use super::reactor::{Interest, Reactor, Ready};
use super::task::{JoinHandle, Task, TaskRecord, TaskState, TaskTag, Waker};
use crate::error::{JoinError, RuntimeError};
use crate::sync::Atom;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread;

// ============================================================================
// Worker context
// ============================================================================

struct WorkerContext {
    runtime: Weak<RuntimeInner>,
    index: usize,
}

thread_local! {
    static WORKER: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

fn enter_worker(runtime: Weak<RuntimeInner>, index: usize) {
    WORKER.with(|worker| *worker.borrow_mut() = Some(WorkerContext { runtime, index }));
    tracing::trace!(index, "worker registered");
}

/// Whether the calling thread is a worker of some runtime
pub(crate) fn on_worker() -> bool {
    WORKER.with(|worker| worker.borrow().is_some())
}

fn current_runtime() -> Option<Arc<RuntimeInner>> {
    WORKER.with(|worker| worker.borrow().as_ref().and_then(|ctx| ctx.runtime.upgrade()))
}

// ============================================================================
// RuntimeInner
// ============================================================================

pub(crate) struct RuntimeInner {
    pool: WorkerPool,
    reactor: Reactor,

    /// Task being resumed on each worker (empty between resumptions, and
    /// after the running task handed itself to a waker)
    slots: Vec<Atom<Option<Task>>>,

    /// Tasks spawned and not yet retired
    alive: AtomicUsize,

    /// Set while a thread is inside `run`
    running: AtomicBool,

    options: RuntimeOptions,
}

impl RuntimeInner {
    pub(crate) fn admit_task(&self) {
        self.alive.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn retire_task(&self) {
        self.alive.fetch_sub(1, Ordering::AcqRel);
    }

    /// Index of the calling thread if it is one of this runtime's workers
    fn worker_index(self: &Arc<Self>) -> Option<usize> {
        WORKER.with(|worker| {
            worker
                .borrow()
                .as_ref()
                .filter(|ctx| std::ptr::eq(ctx.runtime.as_ptr(), Arc::as_ptr(self)))
                .map(|ctx| ctx.index)
        })
    }

    /// Queue one resumption of `task`
    pub(crate) fn schedule(self: &Arc<Self>, task: Task) {
        let runtime = Arc::downgrade(self);
        self.pool.push(Box::new(move || match runtime.upgrade() {
            Some(runtime) => runtime.resume(task),
            None => drop(task),
        }));
    }

    /// Body of a scheduler job: resume the task's current frame once
    fn resume(self: &Arc<Self>, task: Task) {
        let Some(index) = self.worker_index() else {
            crate::fatal!("{} resumed outside a worker of its runtime", task.tag());
        };
        let record = Arc::clone(task.record());

        let mut chain = record.chain.acquire();
        if record.is_killed() {
            let dead = chain.take();
            chain.release();
            drop(dead);
            return;
        }
        let Some(frames) = chain.as_mut() else {
            return;
        };
        if !frames.owned_by(self) {
            crate::fatal!("{} resumed by a runtime that does not own its frame", record.tag());
        }

        record.set_state(TaskState::Running);
        let previous = self.slots[index].acquire().replace(task);
        debug_assert!(previous.is_none(), "worker slot was occupied");
        let step = frames.resume();
        let task = self.slots[index].acquire().take();

        if record.is_killed() {
            // Killed from inside its own resumption
            let dead = chain.take();
            chain.release();
            drop(dead);
            drop(task);
            return;
        }

        match step {
            Step::Finished => {
                let done = chain.take();
                chain.release();
                drop(done);
                record.kill();
                drop(task);
            }
            Step::Pending | Step::Descended | Step::Returned => {
                record.set_state(TaskState::Suspended);
                chain.release();
                // A kill that raced the release found the chain locked and
                // left the teardown to us
                if record.is_killed() {
                    let dead = record.chain.try_acquire().and_then(|mut chain| chain.take());
                    drop(dead);
                }
                // Still in the slot: nobody parked it, so it goes back in line
                if let Some(task) = task {
                    self.schedule(task);
                }
            }
        }
    }

    /// Detach the task running on this worker into a new waker
    #[track_caller]
    fn create_waker(self: &Arc<Self>) -> Waker {
        let Some(index) = self.worker_index() else {
            crate::fatal!("create_waker called outside a worker thread of this runtime");
        };
        let task = self.slots[index].acquire().take();
        match task {
            Some(task) => Waker::new(task),
            None => crate::fatal!("create_waker called with no task on strand-worker-{}", index),
        }
    }

    fn current_task_tag(self: &Arc<Self>) -> Option<TaskTag> {
        let index = self.worker_index()?;
        let slot = self.slots[index].acquire();
        slot.as_ref().map(Task::tag)
    }

    /// Build a task around `fut` without scheduling it
    fn spawn_task<F>(self: &Arc<Self>, fut: F) -> (JoinHandle<F::Output>, Task)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let record = TaskRecord::new(Arc::downgrade(self));
        let owner = Arc::downgrade(&record);
        let root: Resume = Box::pin(async move {
            let value = fut.await;
            if let Some(record) = owner.upgrade() {
                record.complete(Box::new(value));
            }
        });
        *record.chain.acquire() = Some(FrameChain::new(FrameRecord::new(
            Arc::downgrade(self),
            root,
        )));

        let task = Task::new(Arc::clone(&record));
        tracing::trace!(task = %task.tag(), "task spawned");
        (JoinHandle::new(record), task)
    }

    fn shutdown(&self) {
        self.pool.shutdown();
        self.reactor.clear();
        for slot in &self.slots {
            let task = slot.acquire().take();
            drop(task);
        }
        tracing::debug!(alive = self.alive.load(Ordering::Acquire), "runtime shut down");
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable access to a runtime, usable from inside its tasks.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<RuntimeInner>,
}

impl Handle {
    /// Handle of the runtime whose worker is calling. Fatal on any other thread.
    #[track_caller]
    pub fn current() -> Handle {
        match Self::try_current() {
            Some(handle) => handle,
            None => crate::fatal!("Handle::current called outside a runtime worker"),
        }
    }

    /// Handle of the runtime whose worker is calling, if any
    pub fn try_current() -> Option<Handle> {
        current_runtime().map(|inner| Handle { inner })
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<RuntimeInner> {
        Arc::downgrade(&self.inner)
    }

    /// Spawn `fut` as a new task and schedule it
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (join, task) = self.inner.spawn_task(fut);
        Waker::new(task).wake();
        join
    }

    /// Spawn the computation produced by `make`; the closure is boxed
    /// before anything else happens to it
    pub fn spawn_with<C, F>(&self, make: C) -> JoinHandle<F::Output>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let make: Box<dyn FnOnce() -> F + Send> = Box::new(make);
        self.spawn(async move { make().await })
    }

    /// Spawn `fut` without scheduling it. The task starts when the returned
    /// waker is woken, and is killed if the waker is dropped instead.
    pub fn spawn_deferred<F>(&self, fut: F) -> (JoinHandle<F::Output>, Waker)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (join, task) = self.inner.spawn_task(fut);
        (join, Waker::new(task))
    }

    /// Wrap `fut` as a nested computation of the awaiting task
    pub fn coro<F>(&self, fut: F) -> Coro<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        Coro::new(self, fut)
    }

    /// Detach the calling task into a waker.
    ///
    /// Only valid on one of this runtime's workers while it resumes a task;
    /// anything else is fatal.
    #[track_caller]
    pub fn create_waker(&self) -> Waker {
        self.inner.create_waker()
    }

    /// Suspend the calling task until `fd` is ready for `interest`
    pub fn ready(&self, fd: RawFd, interest: Interest) -> Ready {
        Ready::new(self.clone(), fd, interest)
    }

    /// Tag of the task running on the calling worker
    pub fn current_task_tag(&self) -> Option<TaskTag> {
        self.inner.current_task_tag()
    }

    /// Index of the calling worker, if it belongs to this runtime
    pub fn worker_index(&self) -> Option<usize> {
        self.inner.worker_index()
    }

    /// Tasks spawned and not yet retired
    pub fn alive_tasks(&self) -> usize {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// The runtime's reactor
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }

    /// Options the runtime was built with
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("workers", &self.inner.pool.size())
            .field("alive", &self.alive_tasks())
            .finish()
    }
}

/// Detach the task running on this worker into a waker. Fatal outside a worker.
#[track_caller]
pub fn create_waker() -> Waker {
    match current_runtime() {
        Some(runtime) => runtime.create_waker(),
        None => crate::fatal!("create_waker called outside a runtime worker"),
    }
}

// ============================================================================
// yield_now
// ============================================================================

/// Future returned by [`yield_now`]
#[derive(Debug, Default)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        Poll::Pending
    }
}

/// Let every already-queued job run before the calling task continues
pub fn yield_now() -> YieldNow {
    YieldNow::default()
}

// ============================================================================
// Runtime
// ============================================================================

/// Task runtime: worker pool, reactor and the loop that drives them.
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime and start its workers
    pub fn new(options: RuntimeOptions) -> Result<Self, RuntimeError> {
        options.validate()?;
        let workers = options.resolved_worker_count();
        let reactor = Reactor::new(options.reactor.clone())?;
        let inner = Arc::new(RuntimeInner {
            pool: WorkerPool::new(workers),
            reactor,
            slots: (0..workers).map(|_| Atom::new(None)).collect(),
            alive: AtomicUsize::new(0),
            running: AtomicBool::new(false),
            options,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .pool
            .start(Arc::new(move |index| enter_worker(weak.clone(), index)))?;
        tracing::debug!(workers, "runtime started");
        Ok(Self { inner })
    }

    /// Default options with `workers` threads
    pub fn with_workers(workers: usize) -> Result<Self, RuntimeError> {
        Self::new(RuntimeOptions {
            worker_count: workers,
            ..RuntimeOptions::default()
        })
    }

    /// Handle to this runtime
    pub fn handle(&self) -> Handle {
        Handle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Run `entry` as a task and drive the reactor until no task is alive.
    ///
    /// Returns the entry task's outcome. Calling this while another `run` is
    /// in progress, or from one of the runtime's own workers, is fatal.
    #[track_caller]
    pub fn run<F, Fut>(&self, entry: F) -> Result<Fut::Output, JoinError>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        if self.inner.worker_index().is_some() {
            crate::fatal!("Runtime::run called from one of its own workers");
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            crate::fatal!("Runtime::run called while the runtime is already running");
        }
        let _running = RunGuard(&self.inner.running);

        let handle = self.handle();
        let mut join = handle.spawn(entry(handle.clone()));
        loop {
            self.inner.reactor.poll();
            if self.inner.alive.load(Ordering::Acquire) == 0 {
                break;
            }
            thread::sleep(self.inner.options.poll_interval);
        }
        join.try_join().unwrap_or(Err(JoinError::Cancelled))
    }

    /// Spawn `fut` as a new task
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn(fut)
    }

    /// See [`Handle::spawn_with`]
    pub fn spawn_with<C, F>(&self, make: C) -> JoinHandle<F::Output>
    where
        C: FnOnce() -> F + Send + 'static,
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn_with(make)
    }

    /// See [`Handle::spawn_deferred`]
    pub fn spawn_deferred<F>(&self, fut: F) -> (JoinHandle<F::Output>, Waker)
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle().spawn_deferred(fut)
    }

    /// Tasks spawned and not yet retired
    pub fn alive_tasks(&self) -> usize {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Whether some thread is inside [`run`](Self::run)
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.inner.pool.size()
    }

    /// The runtime's reactor
    pub fn reactor(&self) -> &Reactor {
        &self.inner.reactor
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.inner.pool.size())
            .field("alive", &self.alive_tasks())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the "already running" flag when `run` returns
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
