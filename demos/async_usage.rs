//! Async usage examples

use esox_connpool::{BoxError, PoolConfiguration, ResourceFactory, ResourcePool};
use std::time::Duration;
use tokio::time::sleep;

struct Counter;

impl ResourceFactory for Counter {
    type Resource = u64;

    fn create(&self) -> Result<u64, BoxError> {
        Ok(0)
    }

    fn validate(&self, _resource: &mut u64, _timeout: Duration) -> bool {
        true
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    println!("=== Esox ConnPool - Async Examples ===\n");

    let config = PoolConfiguration::new()
        .with_pool_name("async")
        .with_max_pool_size(3)
        .with_min_idle(1)
        .with_connection_timeout(Duration::from_millis(500));
    let pool = ResourcePool::new(Counter, config).unwrap();

    // Example 1: Async acquire
    async_acquire(&pool).await;

    // Example 2: Concurrent access
    concurrent_access(&pool).await;

    let closer = pool.clone();
    tokio::task::spawn_blocking(move || closer.shutdown())
        .await
        .unwrap();
}

async fn async_acquire(pool: &ResourcePool<Counter>) {
    println!("1. Async acquire:");
    {
        let mut counter = pool.acquire_async().await.unwrap();
        *counter += 1;
        println!("   Counter now {}", *counter);
    }
    println!();
}

async fn concurrent_access(pool: &ResourcePool<Counter>) {
    println!("2. Concurrent access:");
    let mut handles = Vec::new();

    for i in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            match pool.acquire_async().await {
                Ok(mut counter) => {
                    *counter += 1;
                    sleep(Duration::from_millis(50)).await;
                    println!("   Task {i} saw counter {}", *counter);
                }
                Err(e) => println!("   Task {i} failed: {e}"),
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    println!("   Total resources: {}\n", pool.total());
}
