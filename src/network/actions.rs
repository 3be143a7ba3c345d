//! Network actions
//!
//! One [`NetworkAction`] per fault variant. Prepare resolves the filter and
//! interfaces into a [`NetworkOpts`] record; start and stop only replay the
//! commands that record describes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::filter::{build_filter, AgentPorts, FilterRequest};
use super::interfaces::{list_up_interfaces, pick_flap_interface};
use super::nic_flap::{FlapTask, NicFlapOpts};
use super::opts::*;
use super::tc::DnsErrorType;
use super::{blackhole, NetworkError};
use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::exec::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkAttack {
    Blackhole,
    Bandwidth,
    Delay,
    PackageLoss,
    PackageCorruption,
    BlockDns,
    DnsErrorInjection,
    NicFlap,
}

impl NetworkAttack {
    pub const ALL: [NetworkAttack; 8] = [
        NetworkAttack::Blackhole,
        NetworkAttack::Bandwidth,
        NetworkAttack::Delay,
        NetworkAttack::PackageLoss,
        NetworkAttack::PackageCorruption,
        NetworkAttack::BlockDns,
        NetworkAttack::DnsErrorInjection,
        NetworkAttack::NicFlap,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NetworkAttack::Blackhole => "network-blackhole",
            NetworkAttack::Bandwidth => "network-bandwidth",
            NetworkAttack::Delay => "network-delay",
            NetworkAttack::PackageLoss => "network-package-loss",
            NetworkAttack::PackageCorruption => "network-package-corruption",
            NetworkAttack::BlockDns => "network-block-dns",
            NetworkAttack::DnsErrorInjection => "network-dns-error-injection",
            NetworkAttack::NicFlap => "network-nic-flap",
        }
    }

    fn uses_interfaces(self) -> bool {
        !matches!(self, NetworkAttack::Blackhole | NetworkAttack::BlockDns)
    }

    fn uses_flow_filter(self) -> bool {
        !matches!(self, NetworkAttack::NicFlap)
    }
}

/// Raw config of every network action; unused keys are ignored per variant
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    #[serde(default)]
    hostname: Vec<String>,
    #[serde(default)]
    ip: Vec<String>,
    #[serde(default)]
    port: Vec<String>,
    #[serde(default)]
    network_interface: Vec<String>,
    #[serde(default = "default_delay", deserialize_with = "lenient::u64")]
    network_delay: u64,
    #[serde(default)]
    network_delay_jitter: bool,
    #[serde(default = "default_percentage", deserialize_with = "lenient::u64")]
    percentage: u64,
    #[serde(default)]
    bandwidth: Option<String>,
    #[serde(default = "default_dns_port")]
    dns_port: u16,
    #[serde(default = "default_dns_error_types")]
    dns_error_type: Vec<DnsErrorType>,
    #[serde(default = "default_frequency", deserialize_with = "lenient::u64")]
    frequency: u64,
    #[serde(default = "default_flap_duration", deserialize_with = "lenient::u64")]
    flap_duration: u64,
    #[serde(default)]
    jitter: bool,
}

fn default_delay() -> u64 {
    500
}

fn default_percentage() -> u64 {
    70
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_error_types() -> Vec<DnsErrorType> {
    vec![DnsErrorType::Both]
}

fn default_frequency() -> u64 {
    10_000
}

fn default_flap_duration() -> u64 {
    2_000
}

/// Collapse the requested RCODE set into the single rewrite mode
fn combine_error_types(types: &[DnsErrorType]) -> ActionResult<DnsErrorType> {
    let nx = types.contains(&DnsErrorType::NxDomain);
    let serv = types.contains(&DnsErrorType::ServFail);
    if types.contains(&DnsErrorType::Both) || (nx && serv) {
        Ok(DnsErrorType::Both)
    } else if nx {
        Ok(DnsErrorType::NxDomain)
    } else if serv {
        Ok(DnsErrorType::ServFail)
    } else {
        Err(ActionError::errored("at least one DNS error type is required"))
    }
}

const BITRATE_UNITS: &[&str] = &[
    "bit", "kbit", "mbit", "gbit", "tbit", "bps", "kbps", "mbps", "gbps", "tbps",
];

/// Accept tc rate specs such as `1024kbit` or `10mbps`
fn validate_bitrate(raw: &str) -> ActionResult<String> {
    let value = raw.trim().to_lowercase();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let valid = !number.is_empty()
        && number.parse::<u64>().map(|n| n > 0).unwrap_or(false)
        && BITRATE_UNITS.contains(&unit);
    if !valid {
        return Err(ActionError::errored(format!(
            "invalid bandwidth '{}', expected a number followed by one of {}",
            raw,
            BITRATE_UNITS.join(", ")
        )));
    }
    Ok(value)
}

/// Largest accepted network delay, one hour
const MAX_DELAY_MS: u64 = 3_600_000;

fn delay(value: u64) -> ActionResult<u64> {
    if value > MAX_DELAY_MS {
        return Err(ActionError::errored(format!(
            "network delay {}ms must not exceed {}ms",
            value, MAX_DELAY_MS
        )));
    }
    Ok(value)
}

fn percentage(value: u64) -> ActionResult<u8> {
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| ActionError::errored(format!("percentage {} must be within 0-100", value)))
}

/// Map engine errors raised while preparing
fn prepare_error(e: NetworkError) -> ActionError {
    match e {
        NetworkError::Command(cause) => {
            ActionError::errored_with("failed to inspect host network", cause)
        }
        other => ActionError::errored(other.to_string()),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkState {
    pub opts: NetworkOpts,
    pub duration_ms: u64,
    pub applied: bool,
    #[serde(skip)]
    flap: Option<FlapTask>,
}

pub struct NetworkAction {
    attack: NetworkAttack,
    runner: Arc<dyn CommandRunner>,
    agent: AgentPorts,
}

impl NetworkAction {
    pub fn new(attack: NetworkAttack, runner: Arc<dyn CommandRunner>, agent: AgentPorts) -> Self {
        Self {
            attack,
            runner,
            agent,
        }
    }

    async fn interfaces(&self, requested: &[String]) -> ActionResult<Vec<String>> {
        let requested: Vec<String> = requested
            .iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();
        if !requested.is_empty() {
            return Ok(requested);
        }
        let found = list_up_interfaces(self.runner.as_ref())
            .await
            .map_err(prepare_error)?;
        if found.is_empty() {
            return Err(ActionError::errored("no network interface is up"));
        }
        Ok(found)
    }

    fn flow_parameters(&self) -> Vec<Parameter> {
        let mut parameters = vec![Parameter::duration("duration", "Duration", 30_000)];
        match self.attack {
            NetworkAttack::Bandwidth => parameters.push(
                Parameter::bitrate("bandwidth", "Network Bandwidth", "1024mbit")
                    .describe("Bandwidth available to the matched traffic"),
            ),
            NetworkAttack::Delay => {
                parameters.push(
                    Parameter::duration("networkDelay", "Network Delay", 500)
                        .describe("Delay added to each outgoing packet"),
                );
                parameters.push(
                    Parameter::boolean("networkDelayJitter", "Jitter", false)
                        .describe("Vary the delay by 30%"),
                );
            }
            NetworkAttack::PackageLoss => parameters.push(
                Parameter::percentage("percentage", "Network Loss", 70)
                    .describe("Share of outgoing packets dropped"),
            ),
            NetworkAttack::PackageCorruption => parameters.push(
                Parameter::percentage("percentage", "Package Corruption", 15)
                    .describe("Share of outgoing packets corrupted"),
            ),
            NetworkAttack::BlockDns => parameters.push(
                Parameter::integer("dnsPort", "DNS Port", 53).range(1, 65535),
            ),
            NetworkAttack::DnsErrorInjection => {
                parameters.push(
                    Parameter::string_array("dnsErrorType", "DNS Error Types")
                        .option("NXDOMAIN", "NXDOMAIN")
                        .option("SERVFAIL", "SERVFAIL")
                        .option("Both", "BOTH")
                        .required(),
                );
                parameters.push(Parameter::integer("dnsPort", "DNS Port", 53).range(1, 65535));
            }
            NetworkAttack::Blackhole | NetworkAttack::NicFlap => {}
        }
        if self.attack != NetworkAttack::BlockDns && self.attack != NetworkAttack::DnsErrorInjection
        {
            parameters.push(
                Parameter::string_array("hostname", "Hostname")
                    .describe("Restrict to these hostnames"),
            );
        } else {
            parameters.push(
                Parameter::string_array("hostname", "Hostname")
                    .describe("Restrict to these DNS servers"),
            );
        }
        parameters.push(
            Parameter::string_array("ip", "IP Address/CIDR").describe("Restrict to these networks"),
        );
        if self.attack != NetworkAttack::BlockDns && self.attack != NetworkAttack::DnsErrorInjection
        {
            parameters.push(
                Parameter::string_array("port", "Ports").describe("Restrict to ports or port ranges"),
            );
        }
        if self.attack.uses_interfaces() {
            parameters.push(
                Parameter::string_array("networkInterface", "Network Interface")
                    .describe("Defaults to every interface that is up")
                    .advanced(),
            );
        }
        parameters
    }

    fn flap_parameters(&self) -> Vec<Parameter> {
        vec![
            Parameter::duration("duration", "Duration", 60_000),
            Parameter::duration("frequency", "Frequency", 10_000)
                .describe("Time between the start of two flaps"),
            Parameter::duration("flapDuration", "Flap Duration", 2_000)
                .describe("How long the interface stays down per flap"),
            Parameter::boolean("jitter", "Jitter", false)
                .describe("Vary frequency and flap duration by up to 30%"),
            Parameter::string_array("networkInterface", "Network Interface")
                .describe("Defaults to the interface of the default route")
                .advanced(),
        ]
    }

    async fn prepare_opts(
        &self,
        config: &NetworkConfig,
        request: &PrepareActionRequestBody,
    ) -> ActionResult<NetworkOpts> {
        if !self.attack.uses_flow_filter() {
            let interface = match config.network_interface.iter().find(|i| !i.trim().is_empty()) {
                Some(interface) => interface.trim().to_string(),
                None => pick_flap_interface(self.runner.as_ref())
                    .await
                    .map_err(prepare_error)?,
            };
            let opts = NicFlapOpts {
                interface,
                frequency_ms: config.frequency,
                flap_duration_ms: config.flap_duration,
                jitter: config.jitter,
                agent: self.agent,
            };
            opts.validate().map_err(prepare_error)?;
            return Ok(NetworkOpts::NicFlap(opts));
        }

        let filter_request = FilterRequest {
            hostnames: config.hostname.clone(),
            cidrs: config.ip.clone(),
            ports: config.port.clone(),
            restricted_endpoints: request.execution_context.restricted_endpoints.clone(),
        };
        let filter = build_filter(self.runner.as_ref(), &filter_request, self.agent)
            .await
            .map_err(|e| prepare_error(e.into()))?;

        let interfaces = if self.attack.uses_interfaces() {
            self.interfaces(&config.network_interface).await?
        } else {
            Vec::new()
        };

        let opts = match self.attack {
            NetworkAttack::Blackhole => {
                blackhole::check_cilium(self.runner.as_ref())
                    .await
                    .map_err(prepare_error)?;
                NetworkOpts::Blackhole(BlackholeOpts { filter })
            }
            NetworkAttack::Bandwidth => {
                let raw = config
                    .bandwidth
                    .as_deref()
                    .ok_or_else(|| ActionError::errored("bandwidth is required"))?;
                NetworkOpts::Bandwidth(BandwidthOpts {
                    filter,
                    bandwidth: validate_bitrate(raw)?,
                    interfaces,
                })
            }
            NetworkAttack::Delay => {
                let delay_ms = delay(config.network_delay)?;
                NetworkOpts::Delay(DelayOpts {
                    filter,
                    delay_ms,
                    jitter_ms: if config.network_delay_jitter {
                        delay_ms * 30 / 100
                    } else {
                        0
                    },
                    interfaces,
                })
            }
            NetworkAttack::PackageLoss => NetworkOpts::PackageLoss(PackageLossOpts {
                filter,
                loss: percentage(config.percentage)?,
                interfaces,
            }),
            NetworkAttack::PackageCorruption => {
                NetworkOpts::PackageCorruption(CorruptionOpts {
                    filter,
                    corruption: percentage(config.percentage)?,
                    interfaces,
                })
            }
            NetworkAttack::BlockDns => NetworkOpts::DnsBlock(DnsBlockOpts {
                filter: filter.pin_port(config.dns_port),
                dns_port: config.dns_port,
            }),
            NetworkAttack::DnsErrorInjection => NetworkOpts::DnsError(DnsErrorOpts {
                filter: filter.pin_port(config.dns_port),
                interfaces,
                dns_port: config.dns_port,
                error_type: combine_error_types(&config.dns_error_type)?,
            }),
            NetworkAttack::NicFlap => {
                return Err(anyhow::anyhow!("nic flap has no flow filter").into())
            }
        };
        Ok(opts)
    }
}

#[async_trait]
impl Action for NetworkAction {
    type State = NetworkState;

    fn describe(&self) -> ActionDescription {
        let (label, description) = match self.attack {
            NetworkAttack::Blackhole => ("Block Traffic", "Blocks network traffic (incoming and outgoing)"),
            NetworkAttack::Bandwidth => ("Limit Bandwidth", "Limits the available egress bandwidth"),
            NetworkAttack::Delay => ("Delay Traffic", "Injects latency into egress network traffic"),
            NetworkAttack::PackageLoss => ("Drop Outgoing Traffic", "Drops a share of egress packets"),
            NetworkAttack::PackageCorruption => {
                ("Corrupt Outgoing Packages", "Corrupts a share of egress packets")
            }
            NetworkAttack::BlockDns => ("Block DNS", "Blocks access to DNS servers"),
            NetworkAttack::DnsErrorInjection => (
                "DNS Error Injection",
                "Rewrites DNS responses to NXDOMAIN or SERVFAIL",
            ),
            NetworkAttack::NicFlap => (
                "NIC Flap",
                "Repeatedly takes a network interface down while keeping the agent reachable",
            ),
        };
        let parameters = if self.attack == NetworkAttack::NicFlap {
            self.flap_parameters()
        } else {
            self.flow_parameters()
        };
        ActionDescription::attack(
            self.attack.name(),
            label,
            description,
            "network",
            TimeControl::External,
        )
        .with_parameters(parameters)
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<NetworkState> {
        let config: NetworkConfig = params::parse_config(&request.config)?;
        params::duration_at_least_1s(config.duration)?;
        let opts = self.prepare_opts(&config, request).await?;
        Ok(NetworkState {
            opts,
            duration_ms: config.duration,
            applied: false,
            flap: None,
        })
    }

    async fn start(&self, state: &mut NetworkState) -> ActionResult<StartResult> {
        if let NetworkOpts::NicFlap(opts) = &state.opts {
            state.flap = Some(FlapTask::spawn(
                self.runner.clone(),
                opts.clone(),
                Duration::from_millis(state.duration_ms),
            ));
            state.applied = true;
            return Ok(StartResult::default());
        }

        super::apply(self.runner.as_ref(), &state.opts)
            .await
            .map_err(|e| ActionError::failed_with("failed to apply network fault", e))?;
        state.applied = true;
        info!(kind = state.opts.kind(), "Network attack started");
        Ok(StartResult::default())
    }

    async fn stop(&self, state: &mut NetworkState) -> ActionResult<StopResult> {
        if !state.applied {
            return Ok(StopResult::default());
        }
        state.applied = false;

        if let Some(task) = state.flap.take() {
            task.stop().await;
            return Ok(StopResult::default());
        }

        match super::revert(self.runner.as_ref(), &state.opts).await {
            Ok(()) => Ok(StopResult::default()),
            Err(e) => {
                warn!(kind = state.opts.kind(), "Network revert incomplete: {}", e);
                Ok(StopResult {
                    error: None,
                    messages: vec![Message::warn(e.to_string())],
                })
            }
        }
    }
}
