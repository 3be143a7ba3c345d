//! Execution Timeout Management
//!
//! Every host tool runs under a deadline. The ceilings below apply when the
//! caller does not pick one.

use std::time::Duration;
use tokio::time;

/// `dig` resolution budget, matches `+timeout=4`
pub const DIG_TIMEOUT: Duration = Duration::from_secs(4);

/// `stress-ng -V` availability probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// One discovery refresh, all commands included
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Any other tool (`tc`, `ip`, `iptables`, `nft`, ...)
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeout {
    duration: Duration,
}

impl Default for ExecutionTimeout {
    fn default() -> Self {
        Self::tool()
    }
}

/// Raised when a deadline expires
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("timed out after {0:?}")]
pub struct Elapsed(pub Duration);

impl ExecutionTimeout {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn dig() -> Self {
        Self::new(DIG_TIMEOUT)
    }

    pub fn probe() -> Self {
        Self::new(PROBE_TIMEOUT)
    }

    pub fn discovery() -> Self {
        Self::new(DISCOVERY_TIMEOUT)
    }

    pub fn tool() -> Self {
        Self::new(TOOL_TIMEOUT)
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Execute a future with this deadline
    pub async fn run<F, T>(&self, future: F) -> Result<T, Elapsed>
    where
        F: std::future::Future<Output = T>,
    {
        time::timeout(self.duration, future)
            .await
            .map_err(|_| Elapsed(self.duration))
    }
}
