//! Integration tests for the task tools on a live runtime
//!
//! # Running Tests
//! ```bash
//! cargo test -p strand-tools --test tools_integration
//! ```

use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_core::{yield_now, Runtime};
use strand_tools::{channel, sleep, AsyncMutex, Select, TcpListener, TcpStream, Token};

// ===== Counting =====

#[test]
fn test_hundred_children_count_to_hundred() {
    for workers in 1..=4 {
        let runtime = Runtime::with_workers(workers).unwrap();
        let count = runtime.run(|handle| async move {
            let counter = Arc::new(AsyncMutex::new(0usize));
            let joins: Vec<_> = (0..100)
                .map(|_| {
                    let counter = counter.clone();
                    handle.spawn(async move {
                        *counter.lock().await += 1;
                    })
                })
                .collect();
            for join in joins {
                join.await.unwrap();
            }
            let count = *counter.lock().await;
            count
        });
        assert_eq!(count, Ok(100), "with {} workers", workers);
    }
}

// ===== Channel =====

#[test]
fn test_channel_sum() {
    let runtime = Runtime::with_workers(2).unwrap();
    let sum = runtime.run(|handle| async move {
        let (tx, mut rx) = channel();
        let _producer = handle.spawn(async move {
            for i in 0..10u32 {
                tx.send(i).unwrap();
            }
        });
        let mut sum = 0;
        while let Some(value) = rx.recv().await {
            sum += value;
        }
        sum
    });
    assert_eq!(sum, Ok(45));
}

#[test]
fn test_channel_many_producers_jittered() {
    let runtime = Runtime::with_workers(4).unwrap();
    let mut rng = rand::thread_rng();
    let delays: Vec<u64> = (0..8).map(|_| rng.gen_range(0..5)).collect();

    let received = runtime.run(move |handle| async move {
        let (tx, mut rx) = channel();
        for (producer, delay) in delays.into_iter().enumerate() {
            let tx = tx.clone();
            let _ = handle.spawn(async move {
                sleep(Duration::from_millis(delay)).await;
                for i in 0..25 {
                    tx.send(producer * 100 + i).unwrap();
                    if i % 5 == 0 {
                        yield_now().await;
                    }
                }
            });
        }
        drop(tx);
        let mut received = Vec::new();
        while let Some(value) = rx.recv().await {
            received.push(value);
        }
        received
    });

    let mut received = received.unwrap();
    assert_eq!(received.len(), 8 * 25);
    // Per-producer order is preserved
    for producer in 0..8 {
        let own: Vec<_> = received
            .iter()
            .copied()
            .filter(|v| v / 100 == producer)
            .collect();
        assert!(own.windows(2).all(|w| w[0] < w[1]));
    }
    received.sort_unstable();
    received.dedup();
    assert_eq!(received.len(), 8 * 25);
}

// ===== Select =====

#[test]
fn test_select_runs_winner_continuation_once() {
    let runtime = Runtime::with_workers(3).unwrap();
    let continuations = Arc::new(AtomicUsize::new(0));
    let never = Token::new();
    let winner = runtime.run({
        let continuations = continuations.clone();
        let never = never.clone();
        move |handle| async move {
            let first = continuations.clone();
            let second = continuations.clone();
            Select::new(&handle)
                .case(async { "now" }, move |_| {
                    first.fetch_add(1, Ordering::SeqCst);
                })
                .case(never.wait(), move |_| {
                    second.fetch_add(1000, Ordering::SeqCst);
                })
                .await
        }
    });
    assert_eq!(winner, Ok(0));
    assert_eq!(continuations.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.alive_tasks(), 0);
}

#[test]
fn test_select_timeout_pattern() {
    let runtime = Runtime::with_workers(2).unwrap();
    let started = Instant::now();
    let winner = runtime.run(|handle| async move {
        let stop = Token::new();
        Select::new(&handle)
            .case(stop.wait(), |_| {})
            .case(sleep(Duration::from_millis(20)), |_| {})
            .await
    });
    assert_eq!(winner, Ok(1));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

// ===== TCP =====

#[test]
fn test_tcp_echo_round_trip() {
    let runtime = Runtime::with_workers(2).unwrap();
    let echoed = runtime.run(|handle| async move {
        let listener = TcpListener::bind(&handle, "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = handle.spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut buf = [0u8; 11];
            stream.read_all(&mut buf).await?;
            stream.write_all(&buf).await?;
            Ok::<_, std::io::Error>(())
        });

        let client = TcpStream::connect(&handle, addr).await.unwrap();
        client.write_all(b"hello world").await.unwrap();
        let mut reply = [0u8; 11];
        client.read_all(&mut reply).await.unwrap();
        let served = server.await.unwrap().is_ok();
        (served, reply)
    });
    assert_eq!(echoed, Ok((true, *b"hello world")));
}

#[test]
fn test_read_all_reports_eof() {
    let runtime = Runtime::with_workers(2).unwrap();
    let kind = runtime.run(|handle| async move {
        let listener = TcpListener::bind(&handle, "127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = handle.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"ab").await.unwrap();
            // Dropping the stream closes it after a short write
        });

        let client = TcpStream::connect(&handle, addr).await.unwrap();
        let mut buf = [0u8; 8];
        let err = client.read_all(&mut buf).await.unwrap_err();
        server.await.unwrap();
        err.kind()
    });
    assert_eq!(kind, Ok(std::io::ErrorKind::UnexpectedEof));
}

#[test]
fn test_connect_refused_reports_os_error() {
    let runtime = Runtime::with_workers(1).unwrap();
    // Bind then drop to find a port nobody listens on
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let kind = runtime.run(move |handle| async move {
        TcpStream::connect(&handle, addr).await.map(|_| ()).map_err(|e| e.kind())
    });
    assert_eq!(kind, Ok(Err(std::io::ErrorKind::ConnectionRefused)));
}
