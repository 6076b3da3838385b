//! `strand fanout`: spawn many tasks, release them at once, collect results

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use strand_core::{yield_now, Runtime, RuntimeOptions};
use strand_tools::{channel, sleep, Select, Token};

pub fn execute(
    options: RuntimeOptions,
    tasks: usize,
    yields: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let runtime = Runtime::new(options)?;
    let workers = runtime.worker_count();
    let started = Instant::now();

    let sum = runtime.run(move |handle| async move {
        let start = Token::new();
        let (tx, mut rx) = channel();
        for i in 0..tasks {
            let start = start.clone();
            let tx = tx.clone();
            let _ = handle.spawn(async move {
                start.wait().await;
                for _ in 0..yields {
                    yield_now().await;
                }
                // The collector is gone only after a timeout
                let _ = tx.send(i as u64);
            });
        }
        drop(tx);
        start.go();

        let total = Arc::new(AtomicU64::new(0));
        let collected = async move {
            let mut sum = 0u64;
            while let Some(value) = rx.recv().await {
                sum += value;
            }
            sum
        };
        let winner = Select::new(&handle)
            .case(collected, {
                let total = total.clone();
                move |sum| total.store(sum, Ordering::Release)
            })
            .case(sleep(timeout), |_| {})
            .await;
        (winner == 0).then(|| total.load(Ordering::Acquire))
    })?;

    let elapsed = started.elapsed();
    let Some(sum) = sum else {
        anyhow::bail!("fan-out did not finish within {:?}", timeout);
    };
    let n = tasks as u64;
    let expected = n * n.saturating_sub(1) / 2;
    anyhow::ensure!(
        sum == expected,
        "fan-out lost results: got {}, expected {}",
        sum,
        expected
    );

    let rate = tasks as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} tasks x {} yields on {} workers in {:.2?} ({:.0} tasks/s)",
        tasks, yields, workers, elapsed, rate
    );
    Ok(())
}
