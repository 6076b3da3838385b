//! Contract violations abort the process
//!
//! Each test re-runs this binary filtered to itself with `STRAND_FATAL_CASE`
//! set; the child commits the violation and must die by `SIGABRT` after
//! printing the fatal diagnostic.
//!
//! # Running Tests
//! ```bash
//! cargo test -p strand-core --test fatal_contracts
//! ```

use std::future::Future;
use std::os::unix::process::ExitStatusExt;
use std::pin::pin;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::{yield_now, Runtime, SpinLock};

const CASE_ENV: &str = "STRAND_FATAL_CASE";

/// In the child, run `violate`; in the parent, spawn the child and check
/// that it aborted with `expected` in its diagnostic.
fn assert_fatal(case: &str, expected: &str, violate: impl FnOnce()) {
    if std::env::var(CASE_ENV).as_deref() == Ok(case) {
        violate();
        // Only reached if the violation went unnoticed
        std::process::exit(0);
    }

    let output = Command::new(std::env::current_exe().unwrap())
        .args([case, "--exact", "--nocapture", "--test-threads=1"])
        .env(CASE_ENV, case)
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "child did not abort; status {:?}, stderr:\n{}",
        output.status,
        stderr
    );
    assert!(
        stderr.contains("strand: fatal runtime error"),
        "missing fatal diagnostic:\n{}",
        stderr
    );
    assert!(stderr.contains(expected), "expected {:?} in:\n{}", expected, stderr);
}

#[test]
fn test_spin_lock_self_relock_aborts() {
    assert_fatal(
        "test_spin_lock_self_relock_aborts",
        "re-locked a spin lock",
        || {
            let lock = SpinLock::new();
            lock.lock();
            lock.lock();
        },
    );
}

#[test]
fn test_create_waker_outside_worker_aborts() {
    assert_fatal(
        "test_create_waker_outside_worker_aborts",
        "create_waker called outside a runtime worker",
        || {
            let _waker = strand_core::create_waker();
        },
    );
}

#[test]
fn test_second_concurrent_run_aborts() {
    assert_fatal(
        "test_second_concurrent_run_aborts",
        "already running",
        || {
            let runtime = Runtime::with_workers(1).unwrap();
            thread::scope(|scope| {
                scope.spawn(|| {
                    runtime.run(|_| async {
                        loop {
                            yield_now().await;
                        }
                    })
                });
                let deadline = Instant::now() + Duration::from_secs(5);
                while !runtime.is_running() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                let _ = runtime.run(|_| async {});
            });
        },
    );
}

#[test]
fn test_empty_result_cell_aborts() {
    assert_fatal(
        "test_empty_result_cell_aborts",
        "before its child stored a result",
        || {
            let runtime = Runtime::with_workers(1).unwrap();
            let _ = runtime.run(|handle| async move {
                let mut nested = pin!(handle.coro(async { 1 }));
                // Second poll in the same resumption: the child has not run
                std::future::poll_fn(|cx| {
                    let _ = nested.as_mut().poll(cx);
                    nested.as_mut().poll(cx)
                })
                .await
            });
        },
    );
}
