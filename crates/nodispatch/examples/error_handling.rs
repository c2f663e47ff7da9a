//! Error handling with nodispatch.
//!
//! The dispatcher does not interpret failures: workers report them in their result
//! type and each task's callback decides what to do. Misconfiguration is rejected
//! up front.

use nodispatch::{DispatchError, Dispatcher, DispatcherConfig, worker_fn_async};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Error Handling Example");
    println!("=====================\n");

    example_invalid_config();

    example_failing_tasks().await?;

    Ok(())
}

fn example_invalid_config() {
    println!("1. Invalid configuration");
    println!("------------------------");

    let worker = worker_fn_async(|n: u32| async move { n });

    // no ceiling configured
    match Dispatcher::new(worker, DispatcherConfig::default()) {
        Ok(_) => println!("  Unexpected success"),
        Err(e) => println!("  Rejected: {e}"),
    }

    match "-4".parse::<nodispatch::Concurrency>() {
        Ok(_) => println!("  Unexpected success"),
        Err(e) => println!("  Rejected: {e}"),
    }

    println!();
}

async fn example_failing_tasks() -> anyhow::Result<()> {
    println!("2. Failures travel through the result");
    println!("-------------------------------------");

    let mut config = DispatcherConfig::default();
    config.with_limit(2);

    let dispatcher = Dispatcher::new(
        worker_fn_async(|i: u64| async move {
            tokio::time::sleep(Duration::from_millis(50 * i)).await;
            if i % 3 == 0 {
                anyhow::bail!("task {i} failed");
            }
            Ok(i)
        }),
        config,
    )?;

    let pending = (0..6).map(|i| dispatcher.submit_async(i)).collect::<Vec<_>>();

    for (i, result) in pending.into_iter().enumerate() {
        match result.await {
            Ok(Ok(value)) => println!("  Task {i} succeeded: {value}"),
            Ok(Err(e)) => println!("  Task {i} failed: {e}"),
            Err(DispatchError::Abandoned) => println!("  Task {i} was abandoned"),
            Err(e) => return Err(e.into()),
        }
    }

    println!();
    Ok(())
}
