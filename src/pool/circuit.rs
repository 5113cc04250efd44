//! Per-host circuit breaker
//!
//! Each host has two cells: a consecutive error counter and an optional
//! "disabled until" deadline. Errors increment the counter; once it exceeds
//! the configured limit the host gets a deadline and the counter restarts
//! from zero. Any success clears the counter.
//!
//! `preflight` consults the deadline before a host is used:
//! - no deadline: proceed
//! - deadline still in the future: the entry is cleared and the call proceeds
//! - deadline reached: the host is black-holed until `reset`

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::HostId;

/// Stand-in deadline for disable durations that overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("Host {0} is disabled by the circuit breaker")]
    HostDisabled(HostId),
}

/// Error counters and disable deadlines for every host
pub struct CircuitBreaker {
    errors: DashMap<HostId, u32>,
    disabled: DashMap<HostId, Instant>,
    error_limit: u32,
    disable_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(error_limit: u32, disable_duration: Duration) -> Self {
        Self {
            errors: DashMap::new(),
            disabled: DashMap::new(),
            error_limit,
            disable_duration,
        }
    }

    /// Check whether a call to `host` may proceed
    pub fn preflight(&self, host: &str) -> Result<(), CircuitError> {
        let deadline = match self.disabled.get(host) {
            Some(deadline) => *deadline,
            None => return Ok(()),
        };

        if Instant::now() >= deadline {
            warn!(host = %host, "Host is black-holed by circuit breaker");
            return Err(CircuitError::HostDisabled(host.to_owned()));
        }

        // Only clear the deadline we looked at, not one set concurrently
        self.disabled.remove_if(host, |_, d| *d == deadline);
        debug!(host = %host, "Circuit breaker entry cleared");
        Ok(())
    }

    /// Clear the error counter for `host`. No entry is created.
    pub fn record_success(&self, host: &str) {
        self.errors.remove(host);
    }

    /// Count one error against `host` and hand the original error back.
    ///
    /// Trips the host once its counter exceeds the error limit.
    pub fn record_error<E>(&self, host: &str, error: E) -> E {
        let count = match self.errors.entry(host.to_owned()) {
            Entry::Occupied(mut entry) => {
                let count = *entry.get() + 1;
                if count > self.error_limit {
                    entry.remove();
                } else {
                    entry.insert(count);
                }
                count
            }
            Entry::Vacant(entry) => {
                if self.error_limit > 0 {
                    entry.insert(1);
                }
                1
            }
        };

        if count > self.error_limit {
            let now = Instant::now();
            let until = now
                .checked_add(self.disable_duration)
                .unwrap_or_else(|| now + FAR_FUTURE);
            self.disabled.insert(host.to_owned(), until);
            warn!(
                host = %host,
                errors = count,
                limit = self.error_limit,
                disabled_for = ?self.disable_duration,
                "Circuit breaker tripped"
            );
        } else {
            debug!(host = %host, errors = count, "Recorded host error");
        }

        error
    }

    /// Manually clear both cells for `host`
    pub fn reset(&self, host: &str) {
        self.errors.remove(host);
        if self.disabled.remove(host).is_some() {
            info!(host = %host, "Circuit breaker manually reset");
        }
    }

    pub fn error_count(&self, host: &str) -> Option<u32> {
        self.errors.get(host).map(|c| *c)
    }

    pub fn disabled_until(&self, host: &str) -> Option<Instant> {
        self.disabled.get(host).map(|d| *d)
    }
}
