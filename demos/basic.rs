//! Basic usage examples for ResourcePool

use esox_connpool::{BoxError, PoolConfiguration, ResourceFactory, ResourcePool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

struct Session {
    id: usize,
    queries: usize,
}

#[derive(Default)]
struct SessionFactory {
    next_id: AtomicUsize,
}

impl ResourceFactory for SessionFactory {
    type Resource = Session;

    fn create(&self) -> Result<Session, BoxError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session { id, queries: 0 })
    }

    fn validate(&self, _session: &mut Session, _timeout: Duration) -> bool {
        true
    }

    fn close(&self, session: Session) {
        println!("   Closing session {} after {} queries", session.id, session.queries);
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Esox ConnPool - Basic Examples ===\n");

    let config = PoolConfiguration::new()
        .with_pool_name("basic")
        .with_max_pool_size(4)
        .with_min_idle(2)
        .with_connection_timeout(Duration::from_secs(2));
    let pool = ResourcePool::new(SessionFactory::default(), config).unwrap();

    // Example 1: Acquire and release
    simple_acquire(&pool);

    // Example 2: Exhaustion and timeout
    exhaustion(&pool);

    // Example 3: Metrics and health
    metrics_and_health(&pool);

    pool.shutdown();
}

fn simple_acquire(pool: &ResourcePool<SessionFactory>) {
    println!("1. Acquire and release:");
    {
        let mut session = pool.acquire().unwrap();
        session.queries += 1;
        println!("   Got session {}", session.id);
        // Session automatically returned when dropped
    }
    println!("   Idle after return: {}\n", pool.idle());
}

fn exhaustion(pool: &ResourcePool<SessionFactory>) {
    println!("2. Exhaustion:");
    let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    println!("   Active: {}, total: {}", pool.active(), pool.total());

    match pool.acquire_timeout(Duration::from_millis(300)) {
        Ok(_) => println!("   Unexpectedly got a session"),
        Err(e) => println!("   Expected timeout: {e}"),
    }

    drop(held);
    println!("   Idle after release: {}\n", pool.idle());
}

fn metrics_and_health(pool: &ResourcePool<SessionFactory>) {
    println!("3. Metrics and health:");
    let metrics = pool.metrics();
    println!("   Acquired: {}", metrics.total_acquired);
    println!("   Timeouts: {}", metrics.timeouts);
    println!("   Created: {}", metrics.resources_created);

    let health = pool.health();
    println!("   Healthy: {}", health.is_healthy());
    for warning in &health.warnings {
        println!("   Warning: {warning}");
    }

    println!("\n{}", pool.export_metrics_prometheus(None));
}
