//! Task, Waker and JoinHandle
//!
//! A [`Task`] is the unique owner of a computation's right to run. At any
//! moment it sits in exactly one place: a queued job, a worker slot (while
//! it runs), or a parked [`Waker`]. Whoever holds it decides when it runs
//! next; dropping it kills the computation.

use super::frame::FrameChain;
use super::runtime::RuntimeInner;
use crate::error::JoinError;
use crate::sync::Atom;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Opaque identity of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskTag(u64);

static NEXT_TASK_TAG: AtomicU64 = AtomicU64::new(1);

impl TaskTag {
    fn next() -> Self {
        TaskTag(NEXT_TASK_TAG.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Spawned, never resumed
    Created,
    /// Being resumed on a worker
    Running,
    /// Parked or queued between resumptions
    Suspended,
    /// Root frame completed and the result was stored
    Completed,
    /// Killed before completing
    Killed,
}

impl TaskState {
    /// Whether the task can never run again
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Killed)
    }
}

pub(crate) struct Completion {
    state: TaskState,
    result: Option<Box<dyn Any + Send>>,
    /// Set once a join has taken `result`
    taken: bool,
    joiners: Vec<Waker>,
}

/// State shared between a task and everyone observing it.
pub(crate) struct TaskRecord {
    tag: TaskTag,
    runtime: Weak<RuntimeInner>,

    /// One-way: once set, the task never runs again
    killswitch: AtomicBool,

    completion: Atom<Completion>,

    /// The frame chain, behind the lock that serialises resumptions
    pub(crate) chain: Atom<Option<FrameChain>>,
}

impl TaskRecord {
    pub(crate) fn new(runtime: Weak<RuntimeInner>) -> Arc<Self> {
        Arc::new(Self {
            tag: TaskTag::next(),
            runtime,
            killswitch: AtomicBool::new(false),
            completion: Atom::new(Completion {
                state: TaskState::Created,
                result: None,
                taken: false,
                joiners: Vec::new(),
            }),
            chain: Atom::new(None),
        })
    }

    pub(crate) fn tag(&self) -> TaskTag {
        self.tag
    }

    pub(crate) fn runtime(&self) -> Option<Arc<RuntimeInner>> {
        self.runtime.upgrade()
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killswitch.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> TaskState {
        self.completion.acquire().state
    }

    /// Record a state transition; terminal states are final
    pub(crate) fn set_state(&self, state: TaskState) {
        let mut completion = self.completion.acquire();
        if !completion.state.is_terminal() {
            completion.state = state;
        }
    }

    /// Store the root frame's result
    pub(crate) fn complete(&self, value: Box<dyn Any + Send>) {
        let mut completion = self.completion.acquire();
        if completion.state.is_terminal() {
            return;
        }
        completion.result = Some(value);
        completion.state = TaskState::Completed;
    }

    /// Set the killswitch, retire the task and wake its joiners.
    ///
    /// The chain is torn down here unless a resumption holds it, in which
    /// case that resumption tears it down once its poll returns.
    pub(crate) fn kill(&self) {
        if self.killswitch.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.retire_task();
        }

        let chain = self.chain.try_acquire().and_then(|mut chain| chain.take());
        drop(chain);

        let joiners = {
            let mut completion = self.completion.acquire();
            if !completion.state.is_terminal() {
                completion.state = TaskState::Killed;
            }
            std::mem::take(&mut completion.joiners)
        };
        tracing::trace!(task = %self.tag, joiners = joiners.len(), "task retired");
        for mut joiner in joiners {
            joiner.wake();
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// Exclusive right to run a computation. Dropping it kills the computation.
pub struct Task {
    record: Arc<TaskRecord>,
}

impl Task {
    /// Wrap `record` and count it as alive on its runtime
    pub(crate) fn new(record: Arc<TaskRecord>) -> Self {
        if let Some(runtime) = record.runtime() {
            runtime.admit_task();
        }
        Self { record }
    }

    pub(crate) fn record(&self) -> &Arc<TaskRecord> {
        &self.record
    }

    /// Identity of the task
    pub fn tag(&self) -> TaskTag {
        self.record.tag
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.record.state()
    }

    /// Whether the killswitch is set
    pub fn is_killed(&self) -> bool {
        self.record.is_killed()
    }

    /// Stop the computation for good. Idempotent.
    pub fn kill(&self) {
        self.record.kill();
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.record.kill();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("tag", &self.record.tag)
            .field("killed", &self.record.is_killed())
            .finish()
    }
}

// ============================================================================
// Waker
// ============================================================================

/// Single-use handle that puts a parked task back into the run queue.
///
/// Dropping a waker that was never woken kills its task.
#[derive(Default)]
pub struct Waker {
    task: Option<Task>,
}

impl Waker {
    pub(crate) fn new(task: Task) -> Self {
        Self { task: Some(task) }
    }

    /// Schedule the task. No-op if already woken or if the task was killed.
    pub fn wake(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if task.is_killed() {
            return;
        }
        match task.record.runtime() {
            Some(runtime) => runtime.schedule(task),
            None => tracing::debug!(task = %task.tag(), "runtime gone, dropping woken task"),
        }
    }

    /// Kill the task instead of waking it
    pub fn kill(&mut self) {
        if let Some(task) = self.task.take() {
            task.kill();
        }
    }

    /// Whether waking would do nothing
    pub fn is_cancelled(&self) -> bool {
        self.task.as_ref().is_none_or(Task::is_killed)
    }

    /// Identity of the bound task, if still bound
    pub fn task_tag(&self) -> Option<TaskTag> {
        self.task.as_ref().map(Task::tag)
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker")
            .field("task", &self.task_tag())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// JoinHandle
// ============================================================================

/// Awaitable reference to a task's outcome.
pub struct JoinHandle<T> {
    record: Arc<TaskRecord>,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub(crate) fn new(record: Arc<TaskRecord>) -> Self {
        Self {
            record,
            _result: PhantomData,
        }
    }

    /// Identity of the task
    pub fn tag(&self) -> TaskTag {
        self.record.tag
    }

    /// Kill the task. Joining it afterwards yields [`JoinError::Cancelled`]
    /// unless it had already completed.
    pub fn kill(&self) {
        self.record.kill();
    }

    /// Whether the task reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.record.state().is_terminal()
    }

    /// Current state of the task
    pub fn state(&self) -> TaskState {
        self.record.state()
    }

    /// Take the outcome without suspending, if there is one.
    ///
    /// The result can be taken once; later joins yield
    /// [`JoinError::AlreadyJoined`].
    pub fn try_join(&mut self) -> Option<Result<T, JoinError>> {
        let mut completion = self.record.completion.acquire();
        Self::outcome(&self.record, &mut completion)
    }

    fn outcome(record: &TaskRecord, completion: &mut Completion) -> Option<Result<T, JoinError>> {
        if let Some(result) = completion.result.take() {
            completion.taken = true;
            return match result.downcast::<T>() {
                Ok(value) => Some(Ok(*value)),
                Err(_) => crate::fatal!("{} produced a result of an unexpected type", record.tag),
            };
        }
        if completion.taken {
            return Some(Err(JoinError::AlreadyJoined));
        }
        if record.is_killed() || completion.state.is_terminal() {
            return Some(Err(JoinError::Cancelled));
        }
        None
    }
}

impl<T: Send + 'static> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut completion = this.record.completion.acquire();
        if let Some(outcome) = Self::outcome(&this.record, &mut completion) {
            return Poll::Ready(outcome);
        }
        // The record lock is held, so kill() cannot slip in between the check
        // and the push and leave this joiner behind
        completion.joiners.push(super::create_waker());
        Poll::Pending
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("tag", &self.record.tag)
            .finish()
    }
}
