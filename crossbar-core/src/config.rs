//! Factory tunables
//!
//! The serde field names (camelCase) are the compatibility-critical key names
//! under which deployments already set these values; `from_env` reads the same
//! names from the process environment, which is how the companion
//! configuration loader hands them to the factory.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tuning knobs for the connection factory, resolved at configure time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FactoryConfig {
    /// Expiry-wheel tick length in ms; upper bound on the time it takes to
    /// reap a connection that never establishes a session.
    pub sessionless_cnxn_timeout: u64,

    /// Number of selector threads. Configure fails when below 1.
    pub num_selector_threads: usize,

    /// Number of I/O worker threads. 0 means the selector threads perform
    /// connection I/O inline.
    pub num_worker_threads: usize,

    /// Size of each worker's reusable I/O buffer. 0 disables the buffer and
    /// connections fall back to gathered writes.
    pub direct_buffer_bytes: usize,

    /// Worker pool join deadline in ms at shutdown.
    pub shutdown_timeout: u64,

    /// Maximum concurrent connections per source IP. 0 means unlimited.
    pub max_client_cnxns: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        let cores = num_cores();
        Self {
            sessionless_cnxn_timeout: 10_000,
            num_selector_threads: default_selector_threads(cores),
            num_worker_threads: 2 * cores,
            direct_buffer_bytes: 64 * 1024,
            shutdown_timeout: 5_000,
            max_client_cnxns: 60,
        }
    }
}

impl FactoryConfig {
    /// Resolve the configuration from the process environment, falling back
    /// to the defaults for unset or unparseable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        read_env("sessionlessCnxnTimeout", &mut config.sessionless_cnxn_timeout);
        read_env("numSelectorThreads", &mut config.num_selector_threads);
        read_env("numWorkerThreads", &mut config.num_worker_threads);
        read_env("directBufferBytes", &mut config.direct_buffer_bytes);
        read_env("shutdownTimeout", &mut config.shutdown_timeout);
        read_env("maxClientCnxns", &mut config.max_client_cnxns);
        config
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_selector_threads < 1 {
            return Err(Error::Config("numSelectorThreads must be at least 1".into()));
        }
        if self.sessionless_cnxn_timeout == 0 {
            return Err(Error::Config("sessionlessCnxnTimeout must be positive".into()));
        }
        Ok(())
    }
}

fn num_cores() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// With large connection counts a single selector becomes the bottleneck
/// before the workers do; sqrt(cores/2) lands at 2 selectors on 8 cores and 4
/// on 32, which is where the upstream sweet spot sits.
fn default_selector_threads(cores: usize) -> usize {
    ((cores as f64 / 2.0).sqrt().ceil() as usize).max(1)
}

fn read_env<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!("ignoring unparseable value for {key}: {raw:?}"),
        }
    }
}
