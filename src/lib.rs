//! kvpool - per-host connection pools with circuit breaking for key-value server fleets

pub mod config;
pub mod core;
pub mod pool;

pub use crate::config::PoolConfig;
pub use crate::core::{
    ErrorKind, MetricsSink, NoopMetrics, OpFuture, OperationError, PoolError, PoolManager,
    ShardRef,
};
