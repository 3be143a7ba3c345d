//! Include/exclude filters
//!
//! A filter bounds which flows an injector touches. Includes default to
//! "any"; excludes always carry the agent's own ports so the control channel
//! survives every attack.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use super::cidr::Cidr;
use super::ports::{PortRange, PortSet};
use super::resolve::resolve_hostnames;
use super::FilterError;
use crate::action::RestrictedEndpoint;
use crate::exec::CommandRunner;

/// One network and port range
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetWithPortRange {
    pub net: Cidr,
    #[serde(rename = "portRange")]
    pub ports: PortRange,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
}

impl NetWithPortRange {
    pub fn new(net: Cidr, ports: PortRange) -> Self {
        Self {
            net,
            ports,
            comment: String::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Filter {
    pub include: Vec<NetWithPortRange>,
    pub exclude: Vec<NetWithPortRange>,
}

impl Filter {
    /// Entries of one address family
    pub fn family(&self, ipv4: bool) -> Filter {
        let keep = |entries: &[NetWithPortRange]| -> Vec<NetWithPortRange> {
            entries
                .iter()
                .filter(|e| e.net.is_ipv4() == ipv4)
                .cloned()
                .collect()
        };
        Filter {
            include: keep(&self.include),
            exclude: keep(&self.exclude),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Restrict every include to a single port
    pub fn pin_port(mut self, port: u16) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        self.include = self
            .include
            .into_iter()
            .map(|mut e| {
                e.ports = PortRange::single(port);
                e
            })
            .filter(|e| seen.insert((e.net, e.ports)))
            .collect();
        self
    }
}

/// The agent's listening ports, never to be disturbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPorts {
    pub port: u16,
    pub health_port: u16,
}

impl Default for AgentPorts {
    fn default() -> Self {
        Self {
            port: 8085,
            health_port: 8081,
        }
    }
}

/// User inputs of a network attack
#[derive(Debug, Clone, Default)]
pub struct FilterRequest {
    pub hostnames: Vec<String>,
    pub cidrs: Vec<String>,
    pub ports: Vec<String>,
    pub restricted_endpoints: Vec<RestrictedEndpoint>,
}

/// Resolve hostnames and assemble the canonical filter
pub async fn build_filter(
    runner: &dyn CommandRunner,
    request: &FilterRequest,
    agent: AgentPorts,
) -> Result<Filter, FilterError> {
    let ports = PortSet::parse(&request.ports)?;

    let mut nets: Vec<Cidr> = request
        .cidrs
        .iter()
        .filter(|c| !c.trim().is_empty())
        .map(|c| c.parse())
        .collect::<Result<_, _>>()?;

    let hostnames: Vec<String> = request
        .hostnames
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if !hostnames.is_empty() {
        let addresses: Vec<IpAddr> = resolve_hostnames(runner, &hostnames).await?;
        nets.extend(addresses.into_iter().map(Cidr::host));
    }

    if nets.is_empty() {
        nets = vec![Cidr::any_v4(), Cidr::any_v6()];
    }
    nets.sort();
    nets.dedup();

    let mut include = Vec::new();
    for net in &nets {
        for range in ports.ranges() {
            include.push(NetWithPortRange::new(*net, *range));
        }
    }

    Ok(Filter {
        include,
        exclude: excludes(agent, &request.restricted_endpoints)?,
    })
}

/// Agent ports for both families plus restricted endpoints
pub fn excludes(
    agent: AgentPorts,
    restricted: &[RestrictedEndpoint],
) -> Result<Vec<NetWithPortRange>, FilterError> {
    let mut excludes = Vec::new();
    for any in [Cidr::any_v4(), Cidr::any_v6()] {
        excludes.push(
            NetWithPortRange::new(any, PortRange::single(agent.port)).with_comment("agent port"),
        );
        excludes.push(
            NetWithPortRange::new(any, PortRange::single(agent.health_port))
                .with_comment("agent health port"),
        );
    }

    for endpoint in restricted {
        let net: Cidr = endpoint.cidr.parse()?;
        let ports = PortRange::new(endpoint.port_min, endpoint.port_max)?;
        excludes.push(NetWithPortRange::new(net, ports).with_comment(endpoint.name.clone()));
    }

    excludes.sort();
    excludes.dedup_by(|a, b| a.net == b.net && a.ports == b.ports);
    Ok(excludes)
}
