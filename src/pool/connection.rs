//! Per-host connection pools
//!
//! This module provides:
//! - The `Connection` / `ConnectionFactory` seams the backend client plugs into
//! - `HostPool`: a bounded, lazily grown set of idle connections for one host
//! - `PoolRegistry`: host -> pool map with race-safe creation on first use
//!
//! Capacity is counted per host in `created` (idle + checked out). A unit of
//! capacity is claimed before a connection is built and handed back only when
//! that connection is retired, so `created` never exceeds `max_size`.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Unique identifier for a backend host
pub type HostId = String;

/// A client connection to a single backend host
#[async_trait]
pub trait Connection: Send + 'static {
    /// Whether the connection can still serve requests
    fn is_alive(&self) -> bool;

    /// Close the connection. Failures are logged by the pool, never propagated.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Builds new connections for a host
#[async_trait]
pub trait ConnectionFactory<C: Connection>: Send + Sync {
    async fn create(&self, host: &str) -> anyhow::Result<C>;
}

/// Error types for checkout
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("No idle connection for {host} within {timeout:?}")]
    Exhausted { host: HostId, timeout: Duration },

    #[error("Failed to create connection to {host}: {source}")]
    Construction {
        host: HostId,
        #[source]
        source: anyhow::Error,
    },
}

/// Point-in-time view of one host pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle queue
    pub idle: usize,

    /// Connections counted against capacity (idle + checked out)
    pub created: usize,
}

/// One unit of claimed capacity.
///
/// Dropping an armed lease hands the unit back, so a checked-out connection
/// whose caller was cancelled mid-operation does not shrink the pool.
struct CapacityLease {
    created: Arc<AtomicUsize>,
    armed: bool,
}

impl CapacityLease {
    fn new(created: Arc<AtomicUsize>) -> Self {
        Self {
            created,
            armed: true,
        }
    }

    /// The connection went back to the idle queue and still holds the unit
    fn keep(mut self) {
        self.armed = false;
    }

    /// The connection is gone; free the unit for a replacement
    fn relinquish(mut self) {
        self.armed = false;
        release_unit(&self.created);
    }
}

impl Drop for CapacityLease {
    fn drop(&mut self) {
        if self.armed {
            release_unit(&self.created);
        }
    }
}

fn release_unit(created: &AtomicUsize) {
    let _ = created.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

/// A connection checked out of a `HostPool`
///
/// Hand it back with `HostPool::release` or retire it with `HostPool::discard`.
pub struct PooledConnection<C> {
    conn: C,
    lease: CapacityLease,
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// Bounded pool of idle connections for one host
pub struct HostPool<C> {
    host: HostId,
    max_size: usize,
    idle_tx: mpsc::Sender<C>,
    idle_rx: Mutex<mpsc::Receiver<C>>,
    created: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl<C: Connection> HostPool<C> {
    pub fn new(host: HostId, max_size: usize) -> Self {
        // Idle connections never outnumber `created`, so `max_size` slots suffice
        let (idle_tx, idle_rx) = mpsc::channel(max_size.max(1));
        Self {
            host,
            max_size,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            created: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Claim one unit of capacity if the pool is below `max_size`
    fn try_claim(&self) -> bool {
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_size).then_some(n + 1)
            })
            .is_ok()
    }

    /// Take a connection, growing the pool by one if it has spare capacity.
    ///
    /// Waits up to `timeout` for an idle connection. A freshly built connection
    /// goes through the idle queue like any other, so the caller that built it
    /// is not guaranteed to be the one that receives it.
    pub async fn checkout<F>(
        &self,
        factory: &F,
        timeout: Duration,
    ) -> Result<PooledConnection<C>, CheckoutError>
    where
        F: ConnectionFactory<C> + ?Sized,
    {
        if self.try_claim() {
            match factory.create(&self.host).await {
                Ok(conn) => {
                    debug!(
                        host = %self.host,
                        created = self.created.load(Ordering::Acquire),
                        "Created new connection"
                    );
                    self.push_idle(conn).await;
                }
                Err(source) => {
                    release_unit(&self.created);
                    warn!(host = %self.host, error = %source, "Connection construction failed");
                    return Err(CheckoutError::Construction {
                        host: self.host.clone(),
                        source,
                    });
                }
            }
        }

        let wait = async {
            let mut idle = self.idle_rx.lock().await;
            idle.recv().await
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(conn)) => Ok(PooledConnection {
                conn,
                lease: CapacityLease::new(Arc::clone(&self.created)),
            }),
            // The sender lives as long as the pool, so `None` only happens if the
            // receiver was closed; treat it like an empty pool.
            Ok(None) | Err(_) => {
                debug!(host = %self.host, timeout = ?timeout, "Checkout timed out");
                Err(CheckoutError::Exhausted {
                    host: self.host.clone(),
                    timeout,
                })
            }
        }
    }

    /// Return a connection for reuse.
    ///
    /// A dead connection, or one released after `close_idle`, is retired
    /// instead so its capacity is freed.
    pub async fn release(&self, pooled: PooledConnection<C>) {
        let PooledConnection { conn, lease } = pooled;

        if !conn.is_alive() || self.closed.load(Ordering::Acquire) {
            self.retire(conn, lease).await;
            return;
        }

        match self.idle_tx.try_send(conn) {
            Ok(()) => lease.keep(),
            Err(TrySendError::Full(conn)) | Err(TrySendError::Closed(conn)) => {
                self.retire(conn, lease).await;
            }
        }
    }

    /// Close a connection and free its unit of capacity
    pub async fn discard(&self, pooled: PooledConnection<C>) {
        let PooledConnection { conn, lease } = pooled;
        self.retire(conn, lease).await;
    }

    async fn retire(&self, mut conn: C, lease: CapacityLease) {
        close_quietly(&self.host, &mut conn).await;
        lease.relinquish();
        debug!(
            host = %self.host,
            created = self.created.load(Ordering::Acquire),
            "Discarded connection"
        );
    }

    async fn push_idle(&self, conn: C) {
        if let Err(TrySendError::Full(mut conn)) | Err(TrySendError::Closed(mut conn)) =
            self.idle_tx.try_send(conn)
        {
            close_quietly(&self.host, &mut conn).await;
            release_unit(&self.created);
        }
    }

    /// Close every idle connection and refuse further returns.
    ///
    /// Connections checked out at the time are untouched; they are retired
    /// when released.
    pub async fn close_idle(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let mut idle = self.idle_rx.lock().await;
        let mut closed = 0;
        while let Ok(mut conn) = idle.try_recv() {
            close_quietly(&self.host, &mut conn).await;
            release_unit(&self.created);
            closed += 1;
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_tx.max_capacity() - self.idle_tx.capacity(),
            created: self.created.load(Ordering::Acquire),
        }
    }
}

async fn close_quietly<C: Connection>(host: &str, conn: &mut C) {
    if let Err(e) = conn.close().await {
        warn!(host = %host, error = %e, "Failed to close connection");
    }
}

/// Host pools keyed by host, created on first use and kept until shutdown
pub struct PoolRegistry<C> {
    pools: DashMap<HostId, Arc<HostPool<C>>>,
    max_pool_size: usize,
}

impl<C: Connection> PoolRegistry<C> {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            pools: DashMap::new(),
            max_pool_size,
        }
    }

    /// Get the pool for `host`, creating it if absent.
    ///
    /// Concurrent first lookups for the same host all receive the same pool.
    pub fn get(&self, host: &str) -> Arc<HostPool<C>> {
        if let Some(pool) = self.pools.get(host) {
            return Arc::clone(&*pool);
        }

        let entry = self.pools.entry(host.to_owned()).or_insert_with(|| {
            info!(host = %host, max_size = self.max_pool_size, "Creating host pool");
            Arc::new(HostPool::new(host.to_owned(), self.max_pool_size))
        });
        Arc::clone(&*entry)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Remove and return every pool
    pub fn drain(&self) -> Vec<Arc<HostPool<C>>> {
        let hosts: Vec<HostId> = self.pools.iter().map(|e| e.key().clone()).collect();
        hosts
            .into_iter()
            .filter_map(|host| self.pools.remove(&host).map(|(_, pool)| pool))
            .collect()
    }

    pub fn stats(&self) -> HashMap<HostId, PoolStats> {
        self.pools
            .iter()
            .map(|e| (e.key().clone(), e.value().stats()))
            .collect()
    }
}
