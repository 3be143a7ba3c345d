//! Blackhole via policy routing
//!
//! Included flows hit a `blackhole` rule; excluded flows are looked up in the
//! main table by a rule with a smaller preference, so they are evaluated
//! first. Rules are submitted per family with `ip -family <f> -force -batch -`.

use super::filter::{Filter, NetWithPortRange};
use super::NetworkError;
use crate::exec::{CommandRunner, SysCommand};

const EXCLUDE_PREF: u32 = 100;
const INCLUDE_PREF: u32 = 101;

fn port_selectors(entry: &NetWithPortRange) -> Vec<String> {
    if entry.ports.is_any() {
        return vec![String::new()];
    }
    ["dport", "sport"]
        .iter()
        .map(|direction| format!(" {} {}", direction, entry.ports))
        .collect()
}

/// `rule add|del` lines for one family's filter
pub fn render_rules(filter: &Filter, verb: &str) -> String {
    let mut lines = Vec::new();
    for entry in &filter.exclude {
        for ports in port_selectors(entry) {
            lines.push(format!(
                "rule {} to {}{} table main pref {}",
                verb, entry.net, ports, EXCLUDE_PREF
            ));
        }
    }
    for entry in &filter.include {
        for ports in port_selectors(entry) {
            lines.push(format!(
                "rule {} blackhole to {}{} pref {}",
                verb, entry.net, ports, INCLUDE_PREF
            ));
        }
    }
    let mut batch = lines.join("\n");
    batch.push('\n');
    batch
}

/// `ip -family <inet|inet6> -force -batch -` commands, families with no
/// include skipped
pub fn batch_commands(filter: &Filter, verb: &str) -> Vec<SysCommand> {
    let mut commands = Vec::new();
    for (ipv4, family) in [(true, "inet"), (false, "inet6")] {
        let part = filter.family(ipv4);
        if part.is_empty() {
            continue;
        }
        commands.push(
            SysCommand::new("ip")
                .args(["-family", family, "-force", "-batch", "-"])
                .stdin(render_rules(&part, verb)),
        );
    }
    commands
}

/// Refuse to blackhole on hosts where Cilium owns routes
pub async fn check_cilium(runner: &dyn CommandRunner) -> Result<(), NetworkError> {
    let output = runner
        .run(&SysCommand::new("ip").args(["route", "show", "table", "all"]))
        .await?;
    if output.stdout.lines().any(|line| line.contains("cilium")) {
        return Err(NetworkError::CiliumDetected);
    }
    Ok(())
}
