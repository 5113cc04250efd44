//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - Lazily grown, bounded connection pools, one per backend host
//! - Timed checkout and safe retirement of broken connections
//! - A per-host circuit breaker that stops traffic to failing hosts

pub mod circuit;
pub mod connection;

pub use circuit::{CircuitBreaker, CircuitError};
pub use connection::{
    CheckoutError, Connection, ConnectionFactory, HostId, HostPool, PoolRegistry, PoolStats,
    PooledConnection,
};
