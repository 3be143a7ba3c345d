//! iptables rule bookkeeping
//!
//! Each installed rule is recorded with its full spec so revert deletes
//! exactly that rule with `-D` and leaves unrelated firewall state alone.

use serde::{Deserialize, Serialize};

use super::filter::Filter;
use crate::exec::SysCommand;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IptablesRule {
    pub ipv6: bool,
    pub chain: String,
    pub spec: Vec<String>,
}

impl IptablesRule {
    pub fn new(ipv6: bool, chain: &str, spec: &[&str]) -> Self {
        Self {
            ipv6,
            chain: chain.to_string(),
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn binary(&self) -> &'static str {
        if self.ipv6 {
            "ip6tables"
        } else {
            "iptables"
        }
    }

    fn command(&self, action: &str) -> SysCommand {
        SysCommand::new(self.binary())
            .args([action, self.chain.as_str()])
            .args(self.spec.iter().cloned())
    }

    pub fn append(&self) -> SysCommand {
        self.command("-A")
    }

    /// Insert at the head of the chain
    pub fn insert(&self) -> SysCommand {
        self.command("-I")
    }

    pub fn delete(&self) -> SysCommand {
        self.command("-D")
    }
}

/// Drop outgoing NTP in both directions of the exchange
pub fn ntp_drop_rules() -> Vec<IptablesRule> {
    ["--dport", "--sport"]
        .iter()
        .map(|direction| {
            IptablesRule::new(false, "OUTPUT", &["-p", "udp", *direction, "123", "-j", "DROP"])
        })
        .collect()
}

/// Rules blocking DNS to included networks, excluded networks accepted first
///
/// Returned as `(rule, insert_at_head)` in installation order.
pub fn dns_block_rules(filter: &Filter, dns_port: u16) -> Vec<(IptablesRule, bool)> {
    let port = dns_port.to_string();
    let mut rules = Vec::new();
    for (entries, target, head) in [
        (&filter.include, "DROP", false),
        (&filter.exclude, "ACCEPT", true),
    ] {
        for entry in entries.iter().filter(|e| e.ports.contains(dns_port)) {
            let net = entry.net.to_string();
            for protocol in ["udp", "tcp"] {
                rules.push((
                    IptablesRule::new(
                        !entry.net.is_ipv4(),
                        "OUTPUT",
                        &["-d", net.as_str(), "-p", protocol, "--dport", port.as_str(), "-j", target],
                    ),
                    head,
                ));
            }
        }
    }
    rules
}
