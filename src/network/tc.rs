//! Traffic control batches
//!
//! Egress attacks install a 4-band `prio` root qdisc. Unclassified traffic
//! follows the priomap into bands 1-3; included flows are steered into band
//! 4 which carries the attack qdisc (netem or tbf). Excluded flows are matched
//! first, at a lower filter priority, and sent to band 1.
//!
//! DNS error injection uses the ingress qdisc and rewrites the RCODE of DNS
//! responses in place with `pedit`, fixing the UDP checksum with `csum`.

use serde::{Deserialize, Serialize};

use super::filter::{Filter, NetWithPortRange};

/// Priomap of the root prio qdisc; never maps into band 4
pub const PRIOMAP: &str = "1 2 2 2 1 2 0 0 1 1 1 1 1 1 1 1";

const EXCLUDE_PRIO: u8 = 1;
const INCLUDE_PRIO: u8 = 2;

/// Qdisc hung below band 4
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttackQdisc {
    /// `netem` with its parameters, e.g. `delay 100ms 30ms`
    Netem(String),
    /// Token bucket limited to a bitrate such as `10mbit`
    Tbf { rate: String },
}

impl AttackQdisc {
    fn render(&self) -> String {
        match self {
            AttackQdisc::Netem(params) => format!("netem {}", params),
            AttackQdisc::Tbf { rate } => format!("tbf rate {} burst 5kb latency 50ms", rate),
        }
    }
}

/// Lines for one interface, without the leading `tc`
#[derive(Debug, Default)]
struct Batch {
    lines: Vec<String>,
}

impl Batch {
    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn finish(self) -> String {
        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

struct Family {
    protocol: &'static str,
    selector: &'static str,
}

const IPV4: Family = Family {
    protocol: "ip",
    selector: "ip",
};

const IPV6: Family = Family {
    protocol: "ipv6",
    selector: "ip6",
};

fn family_of(entry: &NetWithPortRange) -> &'static Family {
    if entry.net.is_ipv4() {
        &IPV4
    } else {
        &IPV6
    }
}

/// u32 selectors for one entry: destination net, then dport and sport
/// alternatives for each aligned block of the port range
fn egress_matches(entry: &NetWithPortRange) -> Vec<String> {
    let family = family_of(entry);
    let net = format!("match {} dst {}", family.selector, entry.net);
    if entry.ports.is_any() {
        return vec![net];
    }
    let mut matches = Vec::new();
    for (value, mask) in entry.ports.masks() {
        for direction in ["dport", "sport"] {
            matches.push(format!(
                "{} match {} {} {} {:#06x}",
                net, family.selector, direction, value, mask
            ));
        }
    }
    matches
}

/// Apply batch for an egress attack on the given interfaces
pub fn render_egress(interfaces: &[String], filter: &Filter, qdisc: &AttackQdisc) -> String {
    let mut batch = Batch::default();
    for interface in interfaces {
        batch.push(format!(
            "qdisc add dev {} root handle 1: prio bands 4 priomap {}",
            interface, PRIOMAP
        ));
        batch.push(format!(
            "qdisc add dev {} parent 1:4 handle 40: {}",
            interface,
            qdisc.render()
        ));
        for (entries, prio, flowid) in [
            (&filter.exclude, EXCLUDE_PRIO, "1:1"),
            (&filter.include, INCLUDE_PRIO, "1:4"),
        ] {
            for entry in entries {
                let protocol = family_of(entry).protocol;
                for selector in egress_matches(entry) {
                    batch.push(format!(
                        "filter add dev {} protocol {} parent 1: prio {} u32 {} flowid {}",
                        interface, protocol, prio, selector, flowid
                    ));
                }
            }
        }
    }
    batch.finish()
}

/// Revert batch for [`render_egress`]
pub fn render_egress_revert(interfaces: &[String]) -> String {
    let mut batch = Batch::default();
    for interface in interfaces {
        batch.push(format!("qdisc del dev {} root handle 1: prio", interface));
    }
    batch.finish()
}

/// RCODE the injected responses carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DnsErrorType {
    #[serde(rename = "NXDOMAIN")]
    NxDomain,
    #[serde(rename = "SERVFAIL")]
    ServFail,
    #[serde(rename = "BOTH")]
    Both,
}

impl DnsErrorType {
    /// `(rcode, transaction id parity)` per rewrite filter
    fn rewrites(self) -> Vec<(u8, Option<u8>)> {
        match self {
            DnsErrorType::NxDomain => vec![(3, None)],
            DnsErrorType::ServFail => vec![(2, None)],
            DnsErrorType::Both => vec![(3, Some(0)), (2, Some(1))],
        }
    }
}

/// Offsets from the start of the IP header to the DNS header (no IP options)
fn dns_header_offset(ipv4: bool) -> u32 {
    if ipv4 {
        20 + 8
    } else {
        40 + 8
    }
}

/// Apply batch rewriting DNS responses from included networks
pub fn render_dns_error(
    interfaces: &[String],
    filter: &Filter,
    dns_port: u16,
    error_type: DnsErrorType,
) -> String {
    let mut batch = Batch::default();
    for interface in interfaces {
        batch.push(format!("qdisc add dev {} ingress", interface));

        for entry in filter.exclude.iter().filter(|e| e.ports.contains(dns_port)) {
            let family = family_of(entry);
            batch.push(format!(
                "filter add dev {} parent ffff: protocol {} prio {} u32 match {} src {} match {} sport {} 0xffff action ok",
                interface, family.protocol, EXCLUDE_PRIO, family.selector, entry.net, family.selector, dns_port
            ));
        }

        for entry in &filter.include {
            let family = family_of(entry);
            let dns = dns_header_offset(entry.net.is_ipv4());
            for (rcode, parity) in error_type.rewrites() {
                let txid = parity
                    .map(|bit| format!(" match u8 {:#04x} 0x01 at {}", bit, dns + 1))
                    .unwrap_or_default();
                batch.push(format!(
                    "filter add dev {} parent ffff: protocol {} prio {} u32 match {} src {} match {} protocol 17 0xff match {} sport {} 0xffff{} action pedit munge offset {} u8 set {:#04x} retain 0x0f pipe action csum udp",
                    interface,
                    family.protocol,
                    INCLUDE_PRIO,
                    family.selector,
                    entry.net,
                    family.selector,
                    family.selector,
                    dns_port,
                    txid,
                    dns + 3,
                    rcode
                ));
            }
        }
    }
    batch.finish()
}

pub fn render_dns_error_revert(interfaces: &[String]) -> String {
    let mut batch = Batch::default();
    for interface in interfaces {
        batch.push(format!("qdisc del dev {} ingress", interface));
    }
    batch.finish()
}
