//! NIC flap
//!
//! A background task alternates the chosen interface between `flapping`
//! (an nft table drops everything except the agent's own ports) and `idle`
//! (table removed). The task ends on cancellation or when the experiment
//! deadline passes, and always leaves the table removed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::filter::AgentPorts;
use super::NetworkError;
use crate::exec::{CommandRunner, SysCommand};

const JITTER_MIN: f64 = 0.7;
const JITTER_MAX: f64 = 1.3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicFlapOpts {
    pub interface: String,
    pub frequency_ms: u64,
    pub flap_duration_ms: u64,
    pub jitter: bool,
    pub agent: AgentPorts,
}

impl NicFlapOpts {
    /// Flap windows must never overlap, even at the jitter extremes
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.frequency_ms == 0 || self.flap_duration_ms == 0 {
            return Err(NetworkError::Precondition(
                "frequency and flap duration must be greater than zero".to_string(),
            ));
        }
        if self.jitter {
            // 0.7 * frequency >= 2 * 1.3 * flap, in integers
            if 7 * self.frequency_ms < 26 * self.flap_duration_ms {
                return Err(NetworkError::Precondition(format!(
                    "with jitter, flap duration {}ms must not exceed {:.0}ms for frequency {}ms",
                    self.flap_duration_ms,
                    (self.frequency_ms as f64 * JITTER_MIN) / (2.0 * JITTER_MAX),
                    self.frequency_ms
                )));
            }
        } else if 2 * self.flap_duration_ms > self.frequency_ms {
            return Err(NetworkError::Precondition(format!(
                "flap duration {}ms must be at most half of frequency {}ms",
                self.flap_duration_ms, self.frequency_ms
            )));
        }
        Ok(())
    }

    pub fn table_name(&self) -> String {
        let sanitized: String = self
            .interface
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("nicflap_{}", sanitized)
    }

    pub fn up_batch(&self) -> String {
        let table = self.table_name();
        let iface = &self.interface;
        let mut lines = vec![
            format!("add table inet {}", table),
            format!(
                "add chain inet {} input {{ type filter hook input priority -300 ; policy accept ; }}",
                table
            ),
            format!(
                "add chain inet {} output {{ type filter hook output priority -300 ; policy accept ; }}",
                table
            ),
        ];
        for port in [self.agent.port, self.agent.health_port] {
            lines.push(format!(
                "add rule inet {} input iif \"{}\" tcp dport {} accept",
                table, iface, port
            ));
            lines.push(format!(
                "add rule inet {} output oif \"{}\" tcp sport {} accept",
                table, iface, port
            ));
        }
        lines.push(format!("add rule inet {} input iif \"{}\" drop", table, iface));
        lines.push(format!("add rule inet {} output oif \"{}\" drop", table, iface));
        let mut batch = lines.join("\n");
        batch.push('\n');
        batch
    }

    pub fn down_batch(&self) -> String {
        let table = self.table_name();
        format!("flush table inet {}\ndelete table inet {}\n", table, table)
    }

    pub fn up_command(&self) -> SysCommand {
        SysCommand::new("nft").args(["-f", "-"]).stdin(self.up_batch())
    }

    pub fn down_command(&self) -> SysCommand {
        SysCommand::new("nft").args(["-f", "-"]).stdin(self.down_batch())
    }

    /// Cycle period and flap width for the next round
    fn next_window(&self, rng: &mut fastrand::Rng) -> (Duration, Duration) {
        let scale = |ms: u64, rng: &mut fastrand::Rng| -> Duration {
            if self.jitter {
                let factor = JITTER_MIN + rng.f64() * (JITTER_MAX - JITTER_MIN);
                Duration::from_millis((ms as f64 * factor) as u64)
            } else {
                Duration::from_millis(ms)
            }
        };
        let cycle = scale(self.frequency_ms, rng);
        let flap = scale(self.flap_duration_ms, rng);
        (cycle, flap)
    }
}

/// Handle to a running flap task
#[derive(Debug)]
pub struct FlapTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl FlapTask {
    /// Start flapping until `duration` elapses or [`FlapTask::stop`] is called
    pub fn spawn(runner: Arc<dyn CommandRunner>, opts: NicFlapOpts, duration: Duration) -> Self {
        let token = CancellationToken::new();
        let deadline = Instant::now() + duration;
        let handle = tokio::spawn(run(runner, opts, deadline, token.clone()));
        Self { token, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait until the interface is restored
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            warn!("NIC flap task ended abnormally: {}", e);
        }
    }
}

/// Sleep until `until`; true when cancelled first
async fn wait(token: &CancellationToken, until: Instant) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep_until(until) => false,
    }
}

async fn run(
    runner: Arc<dyn CommandRunner>,
    opts: NicFlapOpts,
    deadline: Instant,
    token: CancellationToken,
) {
    let mut rng = fastrand::Rng::new();
    info!(interface = %opts.interface, "NIC flap started");

    loop {
        let (cycle, flap) = opts.next_window(&mut rng);

        if let Err(e) = runner.run(&opts.up_command()).await {
            warn!(interface = %opts.interface, "Failed to take interface down: {}", e);
            // Partial table state is possible, the down batch below clears it
        } else {
            debug!(interface = %opts.interface, ?flap, "Interface flapping");
        }

        let cancelled = wait(&token, (Instant::now() + flap).min(deadline)).await;
        if let Err(e) = runner.run(&opts.down_command()).await {
            warn!(interface = %opts.interface, "Failed to restore interface: {}", e);
        }
        if cancelled || Instant::now() >= deadline {
            break;
        }

        let idle = cycle.saturating_sub(flap);
        if wait(&token, (Instant::now() + idle).min(deadline)).await || Instant::now() >= deadline
        {
            break;
        }
    }

    info!(interface = %opts.interface, "NIC flap finished");
}
