//! Integration tests for the pool manager
//!
//! These tests drive `with_connection` against mock connections and verify
//! that pooling, discard and circuit breaking work together.

use async_trait::async_trait;
use kvpool::pool::{Connection, ConnectionFactory};
use kvpool::{
    ErrorKind, MetricsSink, OperationError, PoolConfig, PoolError, PoolManager, ShardRef,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct MockConn {
    id: u32,
    alive: Arc<AtomicBool>,
    closed: Arc<AtomicU32>,
    fail_close: bool,
}

#[async_trait]
impl Connection for MockConn {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        self.alive.store(false, Ordering::SeqCst);
        if self.fail_close {
            anyhow::bail!("socket already torn down");
        }
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    created: AtomicU32,
    closed: Arc<AtomicU32>,
    fail: AtomicBool,
    fail_close: AtomicBool,
}

#[derive(Clone, Default)]
struct MockFactory(Arc<FactoryState>);

impl MockFactory {
    fn created(&self) -> u32 {
        self.0.created.load(Ordering::SeqCst)
    }

    fn closed(&self) -> u32 {
        self.0.closed.load(Ordering::SeqCst)
    }

    fn set_failing(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    fn set_close_failing(&self, fail: bool) {
        self.0.fail_close.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory<MockConn> for MockFactory {
    async fn create(&self, host: &str) -> anyhow::Result<MockConn> {
        if self.0.fail.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused by {}", host);
        }
        Ok(MockConn {
            id: self.0.created.fetch_add(1, Ordering::SeqCst),
            alive: Arc::new(AtomicBool::new(true)),
            closed: Arc::clone(&self.0.closed),
            fail_close: self.0.fail_close.load(Ordering::SeqCst),
        })
    }
}

fn config(max_pool_size: usize, error_limit: u32, disable_secs: u64) -> PoolConfig {
    PoolConfig {
        max_pool_size,
        checkout_timeout_ms: 100,
        operation_timeout_ms: 5_000,
        auto_disable_error_limit: error_limit,
        auto_disable_duration_secs: disable_secs,
    }
}

fn manager(config: PoolConfig) -> (PoolManager<MockConn>, MockFactory) {
    let factory = MockFactory::default();
    let manager = PoolManager::new(config, factory.clone()).unwrap();
    (manager, factory)
}

async fn conn_id(manager: &PoolManager<MockConn>, shard: &ShardRef) -> u32 {
    manager
        .with_connection(shard, |conn| Box::pin(async move { Ok(conn.id) }))
        .await
        .unwrap()
}

async fn client_fault(manager: &PoolManager<MockConn>, shard: &ShardRef) -> ErrorKind {
    manager
        .with_connection(shard, |_conn| {
            Box::pin(async move {
                Err::<(), _>(OperationError::Client(anyhow::anyhow!("broken pipe")))
            })
        })
        .await
        .unwrap_err()
        .kind()
}

#[tokio::test]
async fn test_connection_reused_across_calls() {
    let (manager, factory) = manager(config(4, 5, 30));
    let shard = ShardRef::new(1, "h");

    assert_eq!(conn_id(&manager, &shard).await, 0);
    assert_eq!(conn_id(&manager, &shard).await, 0);
    assert_eq!(factory.created(), 1);

    let stats = manager.stats();
    assert_eq!(stats["h"].idle, 1);
    assert_eq!(stats["h"].created, 1);
}

#[tokio::test(start_paused = true)]
async fn test_third_caller_exhausts_pool_of_two() {
    let (manager, factory) = manager(config(2, 5, 30));
    let manager = Arc::new(manager);
    let shard = ShardRef::new(1, "h");

    let mut handles = Vec::new();
    for _ in 0..3 {
        let manager = Arc::clone(&manager);
        let shard = shard.clone();
        handles.push(tokio::spawn(async move {
            manager
                .with_connection(&shard, |conn| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        Ok(conn.id)
                    })
                })
                .await
        }));
    }

    let mut succeeded = 0;
    let mut exhausted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(err) => {
                assert_eq!(err.kind(), ErrorKind::PoolExhausted);
                assert_eq!(err.host(), "h");
                exhausted += 1;
            }
        }
    }

    assert_eq!(succeeded, 2);
    assert_eq!(exhausted, 1);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_client_fault_discards_connection() {
    let (manager, factory) = manager(config(2, 5, 30));
    let shard = ShardRef::new(1, "h");

    assert_eq!(client_fault(&manager, &shard).await, ErrorKind::ClientFault);
    assert_eq!(factory.closed(), 1);
    assert_eq!(manager.stats()["h"].created, 0);

    // The faulty connection is gone; a fresh one is built
    assert_eq!(conn_id(&manager, &shard).await, 1);
}

#[tokio::test]
async fn test_operation_error_keeps_connection() {
    let (manager, factory) = manager(config(2, 5, 30));
    let shard = ShardRef::new(1, "h");

    let err = manager
        .with_connection(&shard, |_conn| {
            Box::pin(async move {
                Err::<(), _>(OperationError::Other(anyhow::anyhow!("no such key")))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Operation);
    assert!(err.to_string().contains("no such key"));
    assert_eq!(factory.closed(), 0);

    assert_eq!(conn_id(&manager, &shard).await, 0);
}

#[tokio::test]
async fn test_dead_connection_is_not_reused() {
    let (manager, factory) = manager(config(1, 5, 30));
    let shard = ShardRef::new(1, "h");

    manager
        .with_connection(&shard, |conn| {
            Box::pin(async move {
                conn.alive.store(false, Ordering::SeqCst);
                Ok(())
            })
        })
        .await
        .unwrap();

    // Capacity came back, so the single slot can be refilled
    assert_eq!(manager.stats()["h"].created, 0);
    assert_eq!(conn_id(&manager, &shard).await, 1);
    assert_eq!(factory.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_operation_timeout_is_client_fault() {
    let mut cfg = config(2, 5, 30);
    cfg.operation_timeout_ms = 50;
    let (manager, factory) = manager(cfg);
    let shard = ShardRef::new(1, "h");

    let err = manager
        .with_connection(&shard, |_conn| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ClientFault);
    assert_eq!(factory.closed(), 1);
    assert_eq!(manager.stats()["h"].created, 0);
}

#[tokio::test]
async fn test_construction_failure_is_counted() {
    let (manager, factory) = manager(config(2, 5, 30));
    let shard = ShardRef::new(7, "h");
    factory.set_failing(true);

    let err = manager
        .with_connection(&shard, |conn| Box::pin(async move { Ok(conn.id) }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Construction);
    assert!(err.to_string().contains("shard 7"));
    assert_eq!(manager.circuit_breaker().error_count("h"), Some(1));
    assert_eq!(manager.stats()["h"].created, 0);
}

#[tokio::test]
async fn test_acquisition_failures_trip_breaker() {
    // A zero-length disable window has already elapsed by the next preflight
    let (manager, factory) = manager(config(2, 2, 0));
    let shard = ShardRef::new(1, "h");
    factory.set_failing(true);

    for _ in 0..3 {
        let err = manager
            .with_connection(&shard, |conn| Box::pin(async move { Ok(conn.id) }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Construction);
    }

    assert!(manager.circuit_breaker().disabled_until("h").is_some());
    assert_eq!(manager.circuit_breaker().error_count("h"), None);

    factory.set_failing(false);
    let err = manager
        .with_connection(&shard, |conn| Box::pin(async move { Ok(conn.id) }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ShardUnavailable);

    // Black-holed calls never reach the factory
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_preflight_inside_window_lets_call_through() {
    let (manager, factory) = manager(config(2, 0, 30));
    let shard = ShardRef::new(1, "h");

    factory.set_failing(true);
    let err = manager
        .with_connection(&shard, |conn| Box::pin(async move { Ok(conn.id) }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Construction);
    assert!(manager.circuit_breaker().disabled_until("h").is_some());

    factory.set_failing(false);
    assert_eq!(conn_id(&manager, &shard).await, 0);
    assert!(manager.circuit_breaker().disabled_until("h").is_none());
}

#[tokio::test]
async fn test_execution_faults_do_not_accumulate() {
    let (manager, _factory) = manager(config(2, 1, 30));
    let shard = ShardRef::new(1, "h");

    for _ in 0..5 {
        assert_eq!(client_fault(&manager, &shard).await, ErrorKind::ClientFault);
        assert_eq!(manager.circuit_breaker().error_count("h"), None);
    }

    assert!(manager.circuit_breaker().disabled_until("h").is_none());
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let (manager, factory) = manager(config(2, 5, 30));
    let h = ShardRef::new(1, "h");
    let g = ShardRef::new(2, "g");

    async fn hold(manager: &PoolManager<MockConn>, shard: &ShardRef) -> Result<u32, PoolError> {
        manager
            .with_connection(shard, |conn| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(conn.id)
                })
            })
            .await
    }

    let (a, b) = tokio::join!(hold(&manager, &h), hold(&manager, &h));
    a.unwrap();
    b.unwrap();
    assert_eq!(manager.stats()["h"].idle, 2);

    client_fault(&manager, &g).await;
    assert_eq!(manager.stats()["g"].idle, 0);

    let closed_before = factory.closed();
    manager.shutdown().await;

    assert_eq!(factory.closed() - closed_before, 2);
    assert!(manager.stats().is_empty());

    // Pools are rebuilt from scratch
    assert_eq!(conn_id(&manager, &h).await, 3);
    assert_eq!(manager.stats()["h"].created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_respect_max_pool_size() {
    let mut cfg = config(4, 5, 30);
    cfg.checkout_timeout_ms = 10_000;
    let (manager, factory) = manager(cfg);
    let manager = Arc::new(manager);

    let mut handles = Vec::new();
    for i in 0..32u32 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let shard = ShardRef::new(i, "h");
            let observer = Arc::clone(&manager);
            manager
                .with_connection(&shard, move |conn| {
                    Box::pin(async move {
                        let created = observer.stats().get("h").map(|s| s.created).unwrap_or(0);
                        assert!(created <= 4);
                        tokio::task::yield_now().await;
                        Ok(conn.id)
                    })
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(factory.created() <= 4);
    assert!(manager.stats()["h"].created <= 4);
}

#[derive(Default)]
struct RecordingMetrics {
    gauges: Mutex<HashMap<(String, String), u64>>,
    timings: AtomicU32,
}

impl MetricsSink for RecordingMetrics {
    fn record_timing(&self, _metric: &str, _host: &str, _elapsed: Duration) {
        self.timings.fetch_add(1, Ordering::SeqCst);
    }

    fn record_gauge(&self, metric: &str, host: &str, value: u64) {
        self.gauges
            .lock()
            .unwrap()
            .insert((metric.to_string(), host.to_string()), value);
    }
}

#[tokio::test]
async fn test_gauges_reported_per_host() {
    let metrics = Arc::new(RecordingMetrics::default());
    let factory = MockFactory::default();
    let manager = PoolManager::new(config(2, 5, 30), factory)
        .unwrap()
        .with_metrics(metrics.clone());
    let shard = ShardRef::new(1, "h");

    conn_id(&manager, &shard).await;
    manager.report_gauges();

    let gauges = metrics.gauges.lock().unwrap();
    assert_eq!(gauges[&("pool.idle".to_string(), "h".to_string())], 1);
    assert_eq!(gauges[&("pool.created".to_string(), "h".to_string())], 1);
    assert_eq!(metrics.timings.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_checkout_failures_are_timed() {
    let metrics = Arc::new(RecordingMetrics::default());
    let factory = MockFactory::default();
    factory.set_failing(true);
    let manager = PoolManager::new(config(2, 5, 30), factory)
        .unwrap()
        .with_metrics(metrics.clone());
    let shard = ShardRef::new(1, "h");

    let err = manager
        .with_connection(&shard, |conn| Box::pin(async move { Ok(conn.id) }))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Construction);
    assert_eq!(metrics.timings.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invalid_config_rejected() {
    let result = PoolManager::<MockConn>::new(config(0, 5, 30), MockFactory::default());
    assert!(result.is_err());
}

#[tokio::test]
async fn test_close_failure_keeps_original_error() {
    let (manager, factory) = manager(config(2, 5, 30));
    let shard = ShardRef::new(1, "h");
    factory.set_close_failing(true);

    let err = manager
        .with_connection(&shard, |_conn| {
            Box::pin(async move {
                Err::<(), _>(OperationError::Client(anyhow::anyhow!("broken pipe")))
            })
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ClientFault);
    let source = std::error::Error::source(&err).unwrap();
    assert_eq!(source.to_string(), "broken pipe");

    // The close was attempted and the capacity still came back
    assert_eq!(factory.closed(), 1);
    assert_eq!(manager.stats()["h"].created, 0);
}

#[tokio::test]
async fn test_shutdown_survives_close_failures() {
    let (manager, factory) = manager(config(2, 5, 30));
    let h = ShardRef::new(1, "h");
    let g = ShardRef::new(2, "g");
    factory.set_close_failing(true);

    conn_id(&manager, &h).await;
    conn_id(&manager, &g).await;
    assert_eq!(manager.stats()["h"].idle, 1);
    assert_eq!(manager.stats()["g"].idle, 1);

    manager.shutdown().await;

    assert_eq!(factory.closed(), 2);
    assert!(manager.stats().is_empty());
}
