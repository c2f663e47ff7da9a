//! Basic usage of the nodispatch library.
//!
//! Submits a handful of tasks, each completing after a delay, and waits for the
//! dispatcher to drain.

use nodispatch::{Completion, Dispatcher, DispatcherConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("Basic nodispatch example");
    println!("========================\n");

    let mut config = DispatcherConfig::default();
    config.with_limit(2);

    let dispatcher = Dispatcher::new(
        |i: u64, done: Completion<u64>| {
            println!("Task {i} starting...");
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100 * (i + 1))).await;
                done.complete(i * 10);
            });
        },
        config,
    )?;

    for i in 0..5 {
        dispatcher.submit(i, move |result| {
            println!("Task {i} completed with {result}");
        });
    }

    println!(
        "\nAll tasks submitted ({} waiting), waiting for completion...\n",
        dispatcher.depth()
    );

    dispatcher.wait_idle().await;

    println!("\nAll tasks completed!");

    Ok(())
}
