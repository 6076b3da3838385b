//! One-way cancellation token

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_core::{Atom, TaskTag, Waker};

#[derive(Default)]
struct TokenState {
    set: bool,
    waiting: Vec<Waker>,
}

/// Shared flag that goes from unset to set exactly once.
///
/// Clones observe the same flag. Tasks waiting on an unset token park until
/// [`go`](Token::go) is called.
#[derive(Clone, Default)]
pub struct Token {
    state: Arc<Atom<TokenState>>,
}

impl Token {
    /// An unset token
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the token and wake every waiter. Idempotent.
    pub fn go(&self) {
        let waiting = {
            let mut state = self.state.acquire();
            if state.set {
                return;
            }
            state.set = true;
            std::mem::take(&mut state.waiting)
        };
        for mut waker in waiting {
            waker.wake();
        }
    }

    /// Whether the token has been set
    pub fn is_set(&self) -> bool {
        self.state.acquire().set
    }

    /// Future resolving once the token is set
    pub fn wait(&self) -> Wait {
        Wait {
            token: self.clone(),
            parked: None,
        }
    }

    /// Parked waiters
    pub fn waiting(&self) -> usize {
        self.state.acquire().waiting.len()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token").field("set", &self.is_set()).finish()
    }
}

/// Future returned by [`Token::wait`]
///
/// Dropping it while parked (for instance because its task was killed)
/// takes its waker back out of the token.
#[derive(Debug)]
pub struct Wait {
    token: Token,
    /// Task whose waker sits in the token
    parked: Option<TaskTag>,
}

impl Future for Wait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut state = this.token.state.acquire();
        if state.set || this.parked.is_some() {
            this.parked = None;
            return Poll::Ready(());
        }
        let waker = strand_core::create_waker();
        this.parked = waker.task_tag();
        state.waiting.push(waker);
        Poll::Pending
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        let Some(tag) = self.parked.take() else {
            return;
        };
        let removed = {
            let mut state = self.token.state.acquire();
            state
                .waiting
                .iter()
                .position(|waker| waker.task_tag() == Some(tag))
                .map(|index| state.waiting.swap_remove(index))
        };
        drop(removed);
    }
}
