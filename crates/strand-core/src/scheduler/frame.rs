//! Frame chains: how a task suspends into nested computations
//!
//! A task's computation is a chain of frames. Only the innermost frame (the
//! "current" one) is ever polled. Awaiting a [`Coro`] hands a new child frame
//! to the worker, which links it under the current frame and re-enqueues the
//! task; when the child completes, the parent becomes current again and the
//! task is re-enqueued once more. Results travel through a per-frame
//! [`Atom`] cell written by the child and read by the parent.

use super::runtime::{self, Handle, RuntimeInner};
use crate::sync::Atom;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

/// Type-erased resumption point of a frame
pub(crate) type Resume = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// One suspended computation in a task's chain.
pub(crate) struct FrameRecord {
    /// Runtime allowed to resume this frame
    runtime: Weak<RuntimeInner>,

    /// Where execution continues on the next resumption
    resume: Resume,

    /// Frame to return to on completion (`None` for a task's root)
    parent: Option<Box<FrameRecord>>,
}

impl FrameRecord {
    pub(crate) fn new(runtime: Weak<RuntimeInner>, resume: Resume) -> Box<Self> {
        Box::new(Self {
            runtime,
            resume,
            parent: None,
        })
    }

    /// Whether this frame belongs to `runtime`
    pub(crate) fn owned_by(&self, runtime: &Arc<RuntimeInner>) -> bool {
        std::ptr::eq(self.runtime.as_ptr(), Arc::as_ptr(runtime))
    }
}

/// Outcome of resuming a chain once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// The current frame suspended
    Pending,
    /// The current frame handed over a child, which is now current
    Descended,
    /// A nested frame completed and its parent is current again
    Returned,
    /// The root frame completed
    Finished,
}

/// The current frame of a task; every ancestor hangs off it.
pub(crate) struct FrameChain {
    current: Box<FrameRecord>,
}

impl FrameChain {
    pub(crate) fn new(root: Box<FrameRecord>) -> Self {
        Self { current: root }
    }

    /// Number of frames in the chain
    pub(crate) fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = &self.current;
        while let Some(parent) = &frame.parent {
            depth += 1;
            frame = parent;
        }
        depth
    }

    /// Whether `runtime` may resume the current frame
    pub(crate) fn owned_by(&self, runtime: &Arc<RuntimeInner>) -> bool {
        self.current.owned_by(runtime)
    }

    /// Poll the current frame once and restructure the chain accordingly
    pub(crate) fn resume(&mut self) -> Step {
        let mut cx = Context::from_waker(std::task::Waker::noop());
        let poll = self.current.resume.as_mut().poll(&mut cx);
        let child = take_deferred();

        match poll {
            Poll::Ready(()) => {
                if child.is_some() {
                    tracing::trace!("frame completed with an unclaimed child, discarding it");
                }
                drop(child);
                match self.current.parent.take() {
                    Some(parent) => {
                        self.current = parent;
                        Step::Returned
                    }
                    None => Step::Finished,
                }
            }
            Poll::Pending => match child {
                Some(child) => {
                    let parent = std::mem::replace(&mut self.current, child);
                    self.current.parent = Some(parent);
                    Step::Descended
                }
                None => Step::Pending,
            },
        }
    }
}

impl fmt::Debug for FrameChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameChain")
            .field("depth", &self.depth())
            .finish()
    }
}

// ============================================================================
// Child hand-off
// ============================================================================

thread_local! {
    /// Child frame handed over during the poll in progress on this thread
    static DEFERRED: RefCell<Option<Box<FrameRecord>>> = const { RefCell::new(None) };
}

/// Hand `child` to the resumption in progress on this thread
#[track_caller]
fn defer_child(child: Box<FrameRecord>) {
    DEFERRED.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            crate::fatal!("a frame descended into two children in one resumption");
        }
        *slot = Some(child);
    });
}

fn take_deferred() -> Option<Box<FrameRecord>> {
    DEFERRED.with(|slot| slot.borrow_mut().take())
}

// ============================================================================
// Coro
// ============================================================================

enum CoroState<T> {
    Fresh(Box<FrameRecord>, Arc<Atom<Option<T>>>),
    Awaiting(Arc<Atom<Option<T>>>),
    Taken,
}

/// A nested computation that runs as its own frame of the awaiting task.
///
/// Awaiting a `Coro` costs one scheduler hop on the way in and one on the way
/// out; in exchange the child's state lives in its own frame instead of
/// inside the parent's future.
pub struct Coro<T> {
    state: CoroState<T>,
}

impl<T: Send + 'static> Coro<T> {
    /// Wrap `fut` as a child frame owned by `handle`'s runtime
    pub fn new<F>(handle: &Handle, fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let cell = Arc::new(Atom::new(None));
        let slot = Arc::clone(&cell);
        let resume: Resume = Box::pin(async move {
            let value = fut.await;
            *slot.acquire() = Some(value);
        });
        Self {
            state: CoroState::Fresh(FrameRecord::new(handle.downgrade(), resume), cell),
        }
    }
}

impl<T> Future for Coro<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, CoroState::Taken) {
            CoroState::Fresh(child, cell) => {
                if !runtime::on_worker() {
                    crate::fatal!("a nested computation was awaited outside a worker thread");
                }
                defer_child(child);
                this.state = CoroState::Awaiting(cell);
                Poll::Pending
            }
            CoroState::Awaiting(cell) => match cell.acquire().take() {
                Some(value) => Poll::Ready(value),
                None => crate::fatal!("frame resumed before its child stored a result"),
            },
            CoroState::Taken => crate::fatal!("Coro polled after completion"),
        }
    }
}

impl<T> fmt::Debug for Coro<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            CoroState::Fresh(..) => "fresh",
            CoroState::Awaiting(_) => "awaiting",
            CoroState::Taken => "taken",
        };
        f.debug_struct("Coro").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(counter: Arc<AtomicUsize>) -> Box<FrameRecord> {
        FrameRecord::new(
            Weak::new(),
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_root_finishes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut chain = FrameChain::new(record(hits.clone()));
        assert_eq!(chain.depth(), 1);
        assert_eq!(chain.resume(), Step::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_descend_then_return() {
        let hits = Arc::new(AtomicUsize::new(0));
        let child = record(hits.clone());
        let mut child = Some(child);

        // Parent hands over a child on its first poll, finishes on its second
        let parent_hits = hits.clone();
        let parent: Resume = Box::pin(std::future::poll_fn(move |_| {
            if let Some(child) = child.take() {
                defer_child(child);
                Poll::Pending
            } else {
                parent_hits.fetch_add(10, Ordering::SeqCst);
                Poll::Ready(())
            }
        }));

        let mut chain = FrameChain::new(FrameRecord::new(Weak::new(), parent));
        assert_eq!(chain.resume(), Step::Descended);
        assert_eq!(chain.depth(), 2);
        assert_eq!(chain.resume(), Step::Returned);
        assert_eq!(chain.depth(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(chain.resume(), Step::Finished);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_pending_without_child() {
        let mut first = true;
        let resume: Resume = Box::pin(std::future::poll_fn(move |_| {
            if std::mem::take(&mut first) {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        }));
        let mut chain = FrameChain::new(FrameRecord::new(Weak::new(), resume));
        assert_eq!(chain.resume(), Step::Pending);
        assert_eq!(chain.resume(), Step::Finished);
    }

    #[test]
    fn test_foreign_frame_not_owned() {
        let chain = FrameChain::new(record(Arc::new(AtomicUsize::new(0))));
        let runtime = crate::Runtime::with_workers(1).unwrap();
        assert!(!chain.owned_by(runtime.handle().inner()));
    }
}
