//! Unbounded FIFO channel between tasks

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use strand_core::{Atom, Waker};

/// Error returned by [`Sender::send`] once the receiver is gone; carries the
/// value back.
#[derive(thiserror::Error)]
#[error("sending on a channel whose receiver was dropped")]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SendError(..)")
    }
}

struct Chan<T> {
    queue: VecDeque<T>,
    /// Parked receiver, if it is waiting for an item
    receiver: Option<Waker>,
    senders: usize,
    receiver_alive: bool,
}

/// Create a channel
pub fn channel<T: Send>() -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Atom::new(Chan {
        queue: VecDeque::new(),
        receiver: None,
        senders: 1,
        receiver_alive: true,
    }));
    (
        Sender {
            chan: Arc::clone(&chan),
        },
        Receiver { chan },
    )
}

/// Sending half; cloneable
pub struct Sender<T> {
    chan: Arc<Atom<Chan<T>>>,
}

impl<T> Sender<T> {
    /// Enqueue `value` and wake the receiver if it is parked
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let receiver = {
            let mut chan = self.chan.acquire();
            if !chan.receiver_alive {
                return Err(SendError(value));
            }
            chan.queue.push_back(value);
            chan.receiver.take()
        };
        if let Some(mut receiver) = receiver {
            receiver.wake();
        }
        Ok(())
    }

    /// Whether the receiver was dropped
    pub fn is_closed(&self) -> bool {
        !self.chan.acquire().receiver_alive
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.acquire().senders += 1;
        Self {
            chan: Arc::clone(&self.chan),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let receiver = {
            let mut chan = self.chan.acquire();
            chan.senders -= 1;
            if chan.senders > 0 {
                return;
            }
            chan.receiver.take()
        };
        // Last sender: a parked receiver must observe the end of the stream
        if let Some(mut receiver) = receiver {
            receiver.wake();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

/// Receiving half
pub struct Receiver<T> {
    chan: Arc<Atom<Chan<T>>>,
}

impl<T> Receiver<T> {
    /// Next item, parking while the queue is empty. `None` once every sender
    /// is gone and the queue is drained.
    pub fn recv(&mut self) -> Recv<'_, T> {
        Recv { receiver: self }
    }

    /// Next item if one is queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.chan.acquire().queue.pop_front()
    }

    /// Queued items
    pub fn len(&self) -> usize {
        self.chan.acquire().queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let (queue, parked) = {
            let mut chan = self.chan.acquire();
            chan.receiver_alive = false;
            (std::mem::take(&mut chan.queue), chan.receiver.take())
        };
        drop(queue);
        drop(parked);
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").field("queued", &self.len()).finish()
    }
}

/// Future returned by [`Receiver::recv`]
pub struct Recv<'a, T> {
    receiver: &'a mut Receiver<T>,
}

impl<T> Future for Recv<'_, T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let mut chan = this.receiver.chan.acquire();
        if let Some(value) = chan.queue.pop_front() {
            return Poll::Ready(Some(value));
        }
        if chan.senders == 0 {
            return Poll::Ready(None);
        }
        chan.receiver = Some(strand_core::create_waker());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::Runtime;

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = channel::<u8>();
        drop(rx);
        assert!(tx.is_closed());
        match tx.send(3) {
            Err(SendError(value)) => assert_eq!(value, 3),
            Ok(()) => panic!("send should fail"),
        }
    }

    #[test]
    fn test_try_recv_fifo() {
        let (tx, mut rx) = channel();
        for i in 0..4 {
            tx.send(i).unwrap();
        }
        assert_eq!(rx.len(), 4);
        let drained: Vec<_> = std::iter::from_fn(|| rx.try_recv()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_recv_ends_when_senders_dropped() {
        let runtime = Runtime::with_workers(2).unwrap();
        let received = runtime.run(|handle| async move {
            let (tx, mut rx) = channel();
            let producer = handle.spawn(async move {
                let extra = tx.clone();
                for i in 0..5 {
                    tx.send(i).unwrap();
                    strand_core::yield_now().await;
                }
                extra.send(99).unwrap();
            });
            let mut received = Vec::new();
            while let Some(value) = rx.recv().await {
                received.push(value);
            }
            producer.await.unwrap();
            received
        });
        assert_eq!(received, Ok(vec![0, 1, 2, 3, 4, 99]));
    }
}
