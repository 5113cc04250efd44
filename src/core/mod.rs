use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::pool::{
    CheckoutError, CircuitBreaker, Connection, ConnectionFactory, HostId, PoolRegistry, PoolStats,
};

/// The shard a request is routed to, and the host serving it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardRef {
    pub shard_id: u32,
    pub host: HostId,
}

impl ShardRef {
    pub fn new(shard_id: u32, host: impl Into<HostId>) -> Self {
        Self {
            shard_id,
            host: host.into(),
        }
    }
}

impl fmt::Display for ShardRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} on {}", self.shard_id, self.host)
    }
}

/// Failure reported by a caller's operation, classified by what it says
/// about the connection
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// The connection is presumed corrupted and must not be reused
    #[error("client fault: {0}")]
    Client(#[source] anyhow::Error),

    /// The operation failed but the connection is still usable
    #[error("{0}")]
    Other(#[source] anyhow::Error),
}

/// Future returned by an operation run against a pooled connection
pub type OpFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, OperationError>> + Send + 'c>>;

/// Error returned by `PoolManager::with_connection`
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No connection to {host} (shard {shard_id}) became available within {timeout:?}")]
    PoolExhausted {
        host: HostId,
        shard_id: u32,
        timeout: Duration,
    },

    #[error("Host {host} (shard {shard_id}) is unavailable")]
    ShardUnavailable { host: HostId, shard_id: u32 },

    #[error("Client fault on {host} (shard {shard_id}): {source}")]
    ClientFault {
        host: HostId,
        shard_id: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Operation failed on {host} (shard {shard_id}): {source}")]
    Operation {
        host: HostId,
        shard_id: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to connect to {host} (shard {shard_id}): {source}")]
    Construction {
        host: HostId,
        shard_id: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Variant tag of a `PoolError`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PoolExhausted,
    ShardUnavailable,
    ClientFault,
    Operation,
    Construction,
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            PoolError::ShardUnavailable { .. } => ErrorKind::ShardUnavailable,
            PoolError::ClientFault { .. } => ErrorKind::ClientFault,
            PoolError::Operation { .. } => ErrorKind::Operation,
            PoolError::Construction { .. } => ErrorKind::Construction,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            PoolError::PoolExhausted { host, .. }
            | PoolError::ShardUnavailable { host, .. }
            | PoolError::ClientFault { host, .. }
            | PoolError::Operation { host, .. }
            | PoolError::Construction { host, .. } => host.as_str(),
        }
    }

    fn from_checkout(err: CheckoutError, shard_id: u32) -> Self {
        match err {
            CheckoutError::Exhausted { host, timeout } => PoolError::PoolExhausted {
                host,
                shard_id,
                timeout,
            },
            CheckoutError::Construction { host, source } => PoolError::Construction {
                host,
                shard_id,
                source,
            },
        }
    }
}

/// Receives pool timings and gauges. Calls are fire-and-forget.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, metric: &str, host: &str, elapsed: Duration);

    fn record_gauge(&self, metric: &str, host: &str, value: u64);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_timing(&self, _metric: &str, _host: &str, _elapsed: Duration) {}

    fn record_gauge(&self, _metric: &str, _host: &str, _value: u64) {}
}

/// Per-host pools and circuit breaking behind a single entry point
///
/// Every call to `with_connection` runs once, without internal retry:
/// breaker preflight, checkout, the caller's operation, then release.
pub struct PoolManager<C: Connection> {
    config: PoolConfig,
    registry: PoolRegistry<C>,
    breaker: CircuitBreaker,
    factory: Arc<dyn ConnectionFactory<C>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<C: Connection> PoolManager<C> {
    pub fn new<F>(config: PoolConfig, factory: F) -> anyhow::Result<Self>
    where
        F: ConnectionFactory<C> + 'static,
    {
        config.validate()?;

        let registry = PoolRegistry::new(config.max_pool_size);
        let breaker = CircuitBreaker::new(
            config.auto_disable_error_limit,
            config.auto_disable_duration(),
        );

        Ok(Self {
            config,
            registry,
            breaker,
            factory: Arc::new(factory),
            metrics: Arc::new(NoopMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run `op` against a pooled connection to `shard.host`.
    ///
    /// A checkout failure is counted against the host's breaker. Once a
    /// connection is checked out, the release phase always runs and ends with
    /// a success signal to the breaker, whatever the operation returned.
    pub async fn with_connection<T, Op>(&self, shard: &ShardRef, op: Op) -> Result<T, PoolError>
    where
        Op: for<'c> FnOnce(&'c mut C) -> OpFuture<'c, T>,
    {
        let host = shard.host.as_str();

        if self.breaker.preflight(host).is_err() {
            return Err(PoolError::ShardUnavailable {
                host: shard.host.clone(),
                shard_id: shard.shard_id,
            });
        }

        let pool = self.registry.get(host);

        let started = Instant::now();
        let checkout = pool
            .checkout(self.factory.as_ref(), self.config.checkout_timeout())
            .await;
        self.metrics.record_timing("pool.checkout", host, started.elapsed());

        let mut conn = match checkout {
            Ok(conn) => conn,
            Err(err) => {
                let err = PoolError::from_checkout(err, shard.shard_id);
                return Err(self.breaker.record_error(host, err));
            }
        };
        debug!(host = %host, shard_id = shard.shard_id, "Checked out connection");

        let op_timeout = self.config.operation_timeout();
        let result = tokio::time::timeout(op_timeout, op(&mut *conn)).await;

        let (outcome, conn) = match result {
            Ok(Ok(value)) => (Ok(value), Some(conn)),
            Ok(Err(OperationError::Other(source))) => {
                let err = PoolError::Operation {
                    host: shard.host.clone(),
                    shard_id: shard.shard_id,
                    source,
                };
                (Err(err), Some(conn))
            }
            Ok(Err(OperationError::Client(source))) => {
                warn!(
                    host = %host,
                    shard_id = shard.shard_id,
                    error = %source,
                    "Client fault, discarding connection"
                );
                pool.discard(conn).await;
                let err = PoolError::ClientFault {
                    host: shard.host.clone(),
                    shard_id: shard.shard_id,
                    source,
                };
                (Err(self.breaker.record_error(host, err)), None)
            }
            Err(_elapsed) => {
                warn!(
                    host = %host,
                    shard_id = shard.shard_id,
                    timeout = ?op_timeout,
                    "Operation timed out, discarding connection"
                );
                pool.discard(conn).await;
                let err = PoolError::ClientFault {
                    host: shard.host.clone(),
                    shard_id: shard.shard_id,
                    source: anyhow::anyhow!("operation timed out after {:?}", op_timeout),
                };
                (Err(self.breaker.record_error(host, err)), None)
            }
        };

        // A discarded connection has nothing left to return
        if let Some(conn) = conn {
            pool.release(conn).await;
        }
        self.breaker.record_success(host);

        outcome
    }

    /// Idle and created counts for every known host
    pub fn stats(&self) -> HashMap<HostId, PoolStats> {
        self.registry.stats()
    }

    /// Push `pool.idle` and `pool.created` gauges for every host to the metrics sink
    pub fn report_gauges(&self) {
        for (host, stats) in self.registry.stats() {
            self.metrics.record_gauge("pool.idle", &host, stats.idle as u64);
            self.metrics.record_gauge("pool.created", &host, stats.created as u64);
        }
    }

    /// Close every idle connection and forget all host pools.
    ///
    /// Connections checked out by in-flight calls are not waited for; callers
    /// should stop issuing requests first.
    pub async fn shutdown(&self) {
        let pools = self.registry.drain();
        let mut closed = 0;
        for pool in &pools {
            let n = pool.close_idle().await;
            debug!(host = %pool.host(), closed = n, "Closed idle connections");
            closed += n;
        }
        info!(hosts = pools.len(), closed = closed, "Connection pools shut down");
    }
}
