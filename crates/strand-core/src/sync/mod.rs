//! Synchronization primitives shared by every runtime component
//!
//! - [`SpinLock`]: exclusive lock with self-deadlock detection
//! - [`Atom`]/[`Transaction`]: a payload that can only be touched while locked

mod atom;
mod spin;

pub use atom::{Atom, Transaction};
pub use spin::SpinLock;
