//! Network Fault Engine
//!
//! Turns user parameters into a canonical include/exclude [`Filter`], renders
//! the variant's rules for `tc`, `ip`, `iptables` or `nft`, and applies them
//! as ordered [`Step`]s. Each step knows its undo, so a failed apply rolls
//! back exactly what this attempt installed and revert never flushes state
//! the agent does not own.
//!
//! # Layout
//!
//! - `cidr.rs`, `ports.rs`: address and port primitives
//! - `filter.rs`, `resolve.rs`: filter assembly and `dig` resolution
//! - `interfaces.rs`: `ip -json link show` and default-route lookup
//! - `tc.rs`, `blackhole.rs`, `iptables.rs`, `nic_flap.rs`: rule renderers
//! - `opts.rs`: the tagged fault variants
//! - `actions.rs`: the network actions exposed to the runtime

pub mod actions;
pub mod blackhole;
pub mod cidr;
pub mod filter;
pub mod interfaces;
pub mod iptables;
pub mod nic_flap;
pub mod opts;
pub mod ports;
pub mod resolve;
pub mod tc;

pub use cidr::Cidr;
pub use filter::{build_filter, AgentPorts, Filter, FilterRequest, NetWithPortRange};
pub use nic_flap::{FlapTask, NicFlapOpts};
pub use opts::{NetworkOpts, Step};
pub use ports::{PortRange, PortSet};
pub use tc::DnsErrorType;

use tracing::{debug, info, warn};

use crate::exec::{CommandError, CommandRunner};

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("could not resolve {hostnames}: {reason}")]
    Resolve { hostnames: String, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to parse {0}")]
    Parse(String),

    #[error("no network interface found")]
    NoInterface,

    #[error("Cilium routes detected on this host; blackhole conflicts with them, use package loss with 100% instead")]
    CiliumDetected,

    #[error("{0}")]
    Precondition(String),

    #[error("revert incomplete: {}", .0.join("; "))]
    Revert(Vec<String>),
}

/// Apply every step; on failure undo the steps attempted so far
pub async fn apply(runner: &dyn CommandRunner, opts: &NetworkOpts) -> Result<(), NetworkError> {
    let steps = opts.steps();
    for (index, step) in steps.iter().enumerate() {
        if let Err(e) = runner.run(&step.apply).await {
            warn!(kind = opts.kind(), "Applying network fault failed, rolling back: {}", e);
            rollback(runner, &steps[..=index]).await;
            return Err(e.into());
        }
    }
    info!(kind = opts.kind(), steps = steps.len(), "Network fault applied");
    Ok(())
}

async fn rollback(runner: &dyn CommandRunner, steps: &[Step]) {
    for step in steps.iter().rev() {
        for undo in &step.undo {
            if let Err(e) = runner.run(undo).await {
                debug!(command = %undo.command_line(), "Rollback step failed: {}", e);
            }
        }
    }
}

/// Run every undo, continuing past failures, and report what failed
pub async fn revert(runner: &dyn CommandRunner, opts: &NetworkOpts) -> Result<(), NetworkError> {
    let mut failures = Vec::new();
    for step in opts.steps().iter().rev() {
        for undo in &step.undo {
            if let Err(e) = runner.run(undo).await {
                failures.push(e.to_string());
            }
        }
    }
    if failures.is_empty() {
        info!(kind = opts.kind(), "Network fault reverted");
        Ok(())
    } else {
        Err(NetworkError::Revert(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;

    fn dns_block() -> NetworkOpts {
        NetworkOpts::DnsBlock(opts::DnsBlockOpts {
            filter: Filter {
                include: vec![NetWithPortRange::new(Cidr::any_v4(), PortRange::single(53))],
                exclude: Vec::new(),
            },
            dns_port: 53,
        })
    }

    #[tokio::test]
    async fn test_apply_rolls_back_installed_rules() {
        let runner = RecordingRunner::new();
        runner.fail("iptables -A OUTPUT -d 0.0.0.0/0 -p tcp", 1, "iptables: No chain");

        let result = apply(&runner, &dns_block()).await;
        assert!(matches!(result, Err(NetworkError::Command(_))));
        assert_eq!(
            runner.lines(),
            vec![
                "iptables -A OUTPUT -d 0.0.0.0/0 -p udp --dport 53 -j DROP",
                "iptables -A OUTPUT -d 0.0.0.0/0 -p tcp --dport 53 -j DROP",
                "iptables -D OUTPUT -d 0.0.0.0/0 -p tcp --dport 53 -j DROP",
                "iptables -D OUTPUT -d 0.0.0.0/0 -p udp --dport 53 -j DROP",
            ]
        );
    }

    #[tokio::test]
    async fn test_revert_continues_past_failures() {
        let runner = RecordingRunner::new();
        runner.fail("iptables -D OUTPUT -d 0.0.0.0/0 -p tcp", 1, "Bad rule");

        let err = revert(&runner, &dns_block()).await.unwrap_err();
        assert!(err.to_string().starts_with("revert incomplete"));
        assert_eq!(runner.lines().len(), 2);
    }

    #[tokio::test]
    async fn test_apply_and_revert_balance() {
        let runner = RecordingRunner::new();
        apply(&runner, &dns_block()).await.unwrap();
        revert(&runner, &dns_block()).await.unwrap();
        let lines = runner.lines();
        let added = lines.iter().filter(|l| l.contains(" -A ")).count();
        let deleted = lines.iter().filter(|l| l.contains(" -D ")).count();
        assert_eq!(added, deleted);
    }
}
