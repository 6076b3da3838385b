//! Runtime error types and the fatal-abort path for contract violations.

use std::fmt;

/// Errors that can occur while building a runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An option failed validation
    #[error("invalid runtime option: {0}")]
    InvalidOption(String),

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv {
        /// Environment variable name
        name: &'static str,
        /// Raw value found in the environment
        value: String,
    },

    /// The OS refused to start a worker thread
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    /// `getrlimit(RLIMIT_NOFILE)` failed
    #[error("failed to query the descriptor limit: {0}")]
    DescriptorLimit(#[source] std::io::Error),
}

/// Outcome of joining a task that did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// The task was killed before its root frame completed
    #[error("task was cancelled before producing a result")]
    Cancelled,

    /// The task completed, but an earlier join already took its result
    #[error("task result was already taken by an earlier join")]
    AlreadyJoined,
}

/// Abort the process after reporting a broken runtime invariant.
///
/// Contract violations (creating a waker outside a worker, starting a second
/// run loop, resuming a frame whose result cell is empty, re-locking a lock
/// the thread already holds) are never recoverable: the state they describe
/// is already corrupt.
#[cold]
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    let location = std::panic::Location::caller();
    tracing::error!(%location, "fatal runtime error: {}", args);
    eprintln!("strand: fatal runtime error at {}: {}", location, args);
    std::process::abort()
}

/// `fatal!` with `format!`-style arguments.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal(format_args!($($arg)*))
    };
}
