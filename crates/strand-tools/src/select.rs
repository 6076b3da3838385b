//! Race several computations; the first to finish wins
//!
//! Each case runs as its own child task. The first child to complete takes
//! the single-shot finish flag, kills every sibling, runs its continuation
//! and only then wakes the selecting task. Losers never run their
//! continuation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_core::{Atom, Handle, JoinHandle, Waker};

struct Race {
    finished: AtomicBool,
    winner: AtomicUsize,
    /// Children not yet completed or torn down
    remaining: AtomicUsize,
    parent: Atom<Option<Waker>>,
    children: Atom<Vec<JoinHandle<()>>>,
}

impl Race {
    fn kill_children(&self) {
        let children = std::mem::take(&mut *self.children.acquire());
        for child in &children {
            child.kill();
        }
    }
}

/// Decrements the live-children count however a child ends. If the last
/// child goes away without a winner, the selecting task can never be
/// resumed, so it is killed instead of leaking.
struct CaseGuard {
    race: Arc<Race>,
}

impl Drop for CaseGuard {
    fn drop(&mut self) {
        if self.race.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && !self.race.finished.load(Ordering::Acquire)
        {
            let parent = self.race.parent.acquire().take();
            if let Some(mut parent) = parent {
                parent.kill();
            }
        }
    }
}

type Starter = Box<dyn FnOnce(&Handle, Arc<Race>, usize) -> JoinHandle<()> + Send>;

enum State {
    Idle,
    Racing(Arc<Race>),
    Done,
}

/// Builder and future for a race between cases; resolves to the index of
/// the winning case.
pub struct Select {
    handle: Handle,
    cases: Vec<Starter>,
    state: State,
}

impl Select {
    /// An empty race on `handle`'s runtime
    pub fn new(handle: &Handle) -> Self {
        Self {
            handle: handle.clone(),
            cases: Vec::new(),
            state: State::Idle,
        }
    }

    /// Add a case: if `fut` finishes first, `then` receives its output
    pub fn case<F, C>(mut self, fut: F, then: C) -> Self
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
        C: FnOnce(F::Output) + Send + 'static,
    {
        self.cases.push(Box::new(move |handle, race, index| {
            let guard = CaseGuard { race };
            handle.spawn(async move {
                let value = fut.await;
                let race = Arc::clone(&guard.race);
                if race.finished.swap(true, Ordering::AcqRel) {
                    return;
                }
                race.winner.store(index, Ordering::Release);

                // Siblings first, so none of them can still be running its
                // computation when the continuation starts
                let me = Handle::current().current_task_tag();
                let children = std::mem::take(&mut *race.children.acquire());
                for child in children.iter().filter(|child| Some(child.tag()) != me) {
                    child.kill();
                }
                drop(children);

                then(value);

                let parent = race.parent.acquire().take();
                if let Some(mut parent) = parent {
                    parent.wake();
                }
                drop(guard);
            })
        }));
        self
    }

    /// Number of cases
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    /// Whether no case was added
    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl Future for Select {
    type Output = usize;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<usize> {
        let this = self.get_mut();
        match std::mem::replace(&mut this.state, State::Done) {
            State::Idle => {
                if this.cases.is_empty() {
                    strand_core::fatal!("select awaited without any case");
                }
                let race = Arc::new(Race {
                    finished: AtomicBool::new(false),
                    winner: AtomicUsize::new(usize::MAX),
                    remaining: AtomicUsize::new(this.cases.len()),
                    parent: Atom::new(None),
                    children: Atom::new(Vec::new()),
                });

                // Park before any child exists, so a winner always finds the waker
                *race.parent.acquire() = Some(this.handle.create_waker());

                // Held while spawning: a fast winner waits here until every
                // sibling is registered and can be killed
                let mut children = race.children.acquire();
                for (index, start) in this.cases.drain(..).enumerate() {
                    children.push(start(&this.handle, Arc::clone(&race), index));
                }
                children.release();

                this.state = State::Racing(race);
                Poll::Pending
            }
            State::Racing(race) => {
                if race.finished.load(Ordering::Acquire) {
                    Poll::Ready(race.winner.load(Ordering::Acquire))
                } else {
                    strand_core::fatal!("select resumed before any case finished");
                }
            }
            State::Done => strand_core::fatal!("Select polled after completion"),
        }
    }
}

impl Drop for Select {
    fn drop(&mut self) {
        if let State::Racing(race) = &self.state {
            race.kill_children();
        }
    }
}

impl std::fmt::Debug for Select {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Idle => "idle",
            State::Racing(_) => "racing",
            State::Done => "done",
        };
        f.debug_struct("Select")
            .field("cases", &self.cases.len())
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Token;
    use std::sync::atomic::AtomicUsize;
    use strand_core::Runtime;

    #[test]
    fn test_immediate_case_wins() {
        let runtime = Runtime::with_workers(2).unwrap();
        let continuations = Arc::new(AtomicUsize::new(0));
        let never = Token::new();
        let winner = runtime.run({
            let continuations = continuations.clone();
            let never = never.clone();
            move |handle| async move {
                let a = continuations.clone();
                let b = continuations.clone();
                Select::new(&handle)
                    .case(never.wait(), move |_| {
                        a.fetch_add(100, Ordering::SeqCst);
                    })
                    .case(async { 7 }, move |value| {
                        b.fetch_add(value, Ordering::SeqCst);
                    })
                    .await
            }
        });
        assert_eq!(winner, Ok(1));
        assert_eq!(continuations.load(Ordering::SeqCst), 7);
        // The losing waiter was killed and torn down
        assert!(!never.is_set());
        assert_eq!(runtime.alive_tasks(), 0);
    }

    #[test]
    fn test_len() {
        let runtime = Runtime::with_workers(1).unwrap();
        let select = Select::new(&runtime.handle())
            .case(async {}, |_| {})
            .case(async {}, |_| {});
        assert_eq!(select.len(), 2);
        assert!(!select.is_empty());
    }
}
