//! Example demonstrating the pool manager
//!
//! This example shows how to:
//! 1. Plug a backend client into the pool through `ConnectionFactory`
//! 2. Run operations with `with_connection`
//! 3. Watch the circuit breaker react to a failing host
//! 4. Inspect pool statistics and shut down
//!
//! Run with `RUST_LOG=debug cargo run --example pool_usage` for pool internals.

use async_trait::async_trait;
use kvpool::pool::{Connection, ConnectionFactory};
use kvpool::{OperationError, PoolConfig, PoolManager, ShardRef};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stand-in for a real key-value client
struct DemoClient {
    host: String,
    id: u32,
    requests: u32,
    open: bool,
}

impl DemoClient {
    async fn get(&mut self, key: &str) -> Result<String, OperationError> {
        self.requests += 1;
        if self.host.starts_with("flaky") && self.requests % 2 == 0 {
            self.open = false;
            return Err(OperationError::Client(anyhow::anyhow!("connection reset")));
        }
        if key.is_empty() {
            return Err(OperationError::Other(anyhow::anyhow!("empty key")));
        }
        Ok(format!("{}@{}#{}", key, self.host, self.id))
    }
}

#[async_trait]
impl Connection for DemoClient {
    fn is_alive(&self) -> bool {
        self.open
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.open = false;
        Ok(())
    }
}

#[derive(Default)]
struct DemoFactory {
    next_id: AtomicU32,
}

#[async_trait]
impl ConnectionFactory<DemoClient> for DemoFactory {
    async fn create(&self, host: &str) -> anyhow::Result<DemoClient> {
        if host.starts_with("down") {
            anyhow::bail!("{} refused connection", host);
        }
        Ok(DemoClient {
            host: host.to_string(),
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            requests: 0,
            open: true,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = PoolConfig {
        max_pool_size: 4,
        auto_disable_error_limit: 2,
        auto_disable_duration_secs: 0,
        ..PoolConfig::default()
    };
    let manager = PoolManager::new(config, DemoFactory::default())?;

    let shards = [
        ShardRef::new(0, "kv-1.example.com"),
        ShardRef::new(1, "flaky-2.example.com"),
        ShardRef::new(2, "down-3.example.com"),
    ];

    for i in 0..12 {
        let shard = &shards[i % shards.len()];
        let key = format!("user:{}", i);

        let result = manager
            .with_connection(shard, |client| Box::pin(async move { client.get(&key).await }))
            .await;

        match result {
            Ok(value) => info!("Request #{} to {} -> {}", i + 1, shard, value),
            Err(e) => warn!("Request #{} to {} failed ({:?}): {}", i + 1, shard, e.kind(), e),
        }
    }

    for (host, stats) in manager.stats() {
        info!(host = %host, idle = stats.idle, created = stats.created, "Pool stats");
    }

    manager.shutdown().await;
    Ok(())
}
