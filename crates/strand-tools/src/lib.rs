//! Strand Tools
//!
//! Building blocks for tasks running on a [`strand_core::Runtime`]:
//!
//! - [`timer`]: timer thread, [`Sleep`] and [`sleep`]
//! - [`Token`]: one-way cancellation flag
//! - [`channel`]: unbounded FIFO channel
//! - [`Select`]: race cases, first finisher wins
//! - [`AsyncMutex`]: queued lock that parks tasks instead of threads
//! - [`net`]: TCP listener and stream on top of the reactor

pub mod channel;
pub mod mutex;
pub mod net;
pub mod select;
pub mod timer;
pub mod token;

pub use channel::{channel, Receiver, Recv, SendError, Sender};
pub use mutex::{AsyncMutex, AsyncMutexGuard, Lock};
pub use net::{TcpListener, TcpStream};
pub use select::Select;
pub use timer::{global_timer, sleep, Sleep, TimerService};
pub use token::{Token, Wait};
