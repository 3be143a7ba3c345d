//! Network fault variants and the commands that apply and revert them

use serde::{Deserialize, Serialize};

use super::blackhole;
use super::filter::Filter;
use super::iptables::dns_block_rules;
use super::nic_flap::NicFlapOpts;
use super::tc::{self, AttackQdisc, DnsErrorType};
use crate::exec::SysCommand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlackholeOpts {
    pub filter: Filter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthOpts {
    pub filter: Filter,
    pub bandwidth: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayOpts {
    pub filter: Filter,
    pub delay_ms: u64,
    pub jitter_ms: u64,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageLossOpts {
    pub filter: Filter,
    pub loss: u8,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorruptionOpts {
    pub filter: Filter,
    pub corruption: u8,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsBlockOpts {
    pub filter: Filter,
    pub dns_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsErrorOpts {
    pub filter: Filter,
    pub interfaces: Vec<String>,
    pub dns_port: u16,
    pub error_type: DnsErrorType,
}

/// One network fault with everything needed to apply and revert it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetworkOpts {
    Blackhole(BlackholeOpts),
    Bandwidth(BandwidthOpts),
    Delay(DelayOpts),
    PackageLoss(PackageLossOpts),
    PackageCorruption(CorruptionOpts),
    DnsBlock(DnsBlockOpts),
    DnsError(DnsErrorOpts),
    NicFlap(NicFlapOpts),
}

/// A command and the commands undoing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub apply: SysCommand,
    pub undo: Vec<SysCommand>,
}

fn tc_batch(batch: String) -> SysCommand {
    SysCommand::new("tc")
        .args(["-force", "-batch", "-"])
        .stdin(batch)
}

fn egress_step(filter: &Filter, interfaces: &[String], qdisc: AttackQdisc) -> Vec<Step> {
    vec![Step {
        apply: tc_batch(tc::render_egress(interfaces, filter, &qdisc)),
        undo: vec![tc_batch(tc::render_egress_revert(interfaces))],
    }]
}

impl NetworkOpts {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            NetworkOpts::Blackhole(_) => "blackhole",
            NetworkOpts::Bandwidth(_) => "bandwidth",
            NetworkOpts::Delay(_) => "delay",
            NetworkOpts::PackageLoss(_) => "package-loss",
            NetworkOpts::PackageCorruption(_) => "package-corruption",
            NetworkOpts::DnsBlock(_) => "dns-block",
            NetworkOpts::DnsError(_) => "dns-error",
            NetworkOpts::NicFlap(_) => "nic-flap",
        }
    }

    /// Ordered steps; reverting runs every undo in reverse order
    pub fn steps(&self) -> Vec<Step> {
        match self {
            NetworkOpts::Blackhole(o) => blackhole::batch_commands(&o.filter, "add")
                .into_iter()
                .zip(blackhole::batch_commands(&o.filter, "del"))
                .map(|(apply, undo)| Step {
                    apply,
                    undo: vec![undo],
                })
                .collect(),
            NetworkOpts::Bandwidth(o) => egress_step(
                &o.filter,
                &o.interfaces,
                AttackQdisc::Tbf {
                    rate: o.bandwidth.clone(),
                },
            ),
            NetworkOpts::Delay(o) => {
                let params = if o.jitter_ms > 0 {
                    format!("delay {}ms {}ms", o.delay_ms, o.jitter_ms)
                } else {
                    format!("delay {}ms", o.delay_ms)
                };
                egress_step(&o.filter, &o.interfaces, AttackQdisc::Netem(params))
            }
            NetworkOpts::PackageLoss(o) => egress_step(
                &o.filter,
                &o.interfaces,
                AttackQdisc::Netem(format!("loss random {}%", o.loss)),
            ),
            NetworkOpts::PackageCorruption(o) => egress_step(
                &o.filter,
                &o.interfaces,
                AttackQdisc::Netem(format!("corrupt {}%", o.corruption)),
            ),
            NetworkOpts::DnsBlock(o) => dns_block_rules(&o.filter, o.dns_port)
                .into_iter()
                .map(|(rule, head)| Step {
                    apply: if head { rule.insert() } else { rule.append() },
                    undo: vec![rule.delete()],
                })
                .collect(),
            NetworkOpts::DnsError(o) => vec![Step {
                apply: tc_batch(tc::render_dns_error(
                    &o.interfaces,
                    &o.filter,
                    o.dns_port,
                    o.error_type,
                )),
                undo: vec![tc_batch(tc::render_dns_error_revert(&o.interfaces))],
            }],
            NetworkOpts::NicFlap(o) => vec![Step {
                apply: o.up_command(),
                undo: vec![o.down_command()],
            }],
        }
    }
}
