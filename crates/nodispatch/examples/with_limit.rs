//! Concurrency limiting with nodispatch.
//!
//! Shows the ceiling holding while a backlog drains, and the notifier firing once
//! at the end.

use nodispatch::{Dispatcher, DispatcherConfig, worker_fn_async};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Concurrency Limiting Example");
    println!("============================\n");

    let concurrent_count = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let limit = 3;
    let start = Instant::now();

    let mut config = DispatcherConfig::default();
    config.with_limit(limit).with_notifier(move || {
        println!("[{:>4}ms] dispatcher drained", start.elapsed().as_millis());
    });
    println!("Concurrency limit set to: {limit}\n");

    let (count, max) = (concurrent_count.clone(), max_seen.clone());
    let dispatcher = Dispatcher::new(
        worker_fn_async(move |i: usize| {
            let count = count.clone();
            let max = max.clone();
            async move {
                let current = count.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(current, Ordering::SeqCst);

                println!(
                    "[{:>4}ms] Task {:>2} started (concurrent: {})",
                    start.elapsed().as_millis(),
                    i,
                    current
                );

                tokio::time::sleep(Duration::from_millis(200)).await;

                count.fetch_sub(1, Ordering::SeqCst);
            }
        }),
        config,
    )?;

    for i in 0..10 {
        dispatcher.submit(i, |()| {});
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "\nrunning: {}, waiting: {}\n",
        dispatcher.in_flight_count(),
        dispatcher.depth()
    );

    dispatcher.wait_idle().await;

    println!("\n========== Summary ==========");
    println!("Total time: {}ms", start.elapsed().as_millis());
    println!("Max concurrent tasks: {}", max_seen.load(Ordering::SeqCst));
    println!("Expected batches: {} (10 tasks / {limit} limit)", 10_usize.div_ceil(limit));

    Ok(())
}
