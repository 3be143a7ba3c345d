//! Host Discovery
//!
//! Publishes this host as a single target. The snapshot is taken at boot and
//! refreshed on an interval; every poll is answered from the cached copy.
//!
//! Attributes:
//! - `host.hostname`, `host.domainname`
//! - `host.ipv4`, `host.ipv6`, `host.nic` (non-loopback only)
//! - `host.os.family`, `host.os.manufacturer`, `host.os.version`
//! - `host.cpu.frequency.min`, `host.cpu.frequency.max` (MHz, when cpufreq exists)
//! - `host.env.<name>` for variables named in the env list
//! - `host.label.<name>` for `steadybit_label_<name>` variables

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::HOST_TARGET_TYPE;
use crate::config::DiscoveryConfig;
use crate::exec::{CommandRunner, SysCommand};
use crate::metrics;
use crate::sysfs::CpuFreq;

pub const LABEL_PREFIX: &str = "steadybit_label_";

pub type Attributes = BTreeMap<String, Vec<String>>;

/// One discovered target as served to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredTarget {
    pub id: String,
    pub label: String,
    pub target_type: String,
    pub attributes: Attributes,
}

/// Static metadata of the discovery endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryDescription {
    pub id: String,
    pub target_type: String,
    pub refresh_interval: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryData {
    pub targets: Vec<DiscoveredTarget>,
}

/// `host.env.*` and `host.label.*` from environment variables
pub fn env_attributes<I>(vars: I, env_list: &[String]) -> Attributes
where
    I: IntoIterator<Item = (String, String)>,
{
    let wanted: Vec<String> = env_list.iter().map(|n| n.to_lowercase()).collect();
    let mut attributes = Attributes::new();
    for (name, value) in vars {
        let name = name.to_lowercase();
        if let Some(label) = name.strip_prefix(LABEL_PREFIX) {
            if !label.is_empty() {
                attributes.insert(format!("host.label.{}", label), vec![value.clone()]);
            }
        }
        if wanted.contains(&name) {
            attributes.insert(format!("host.env.{}", name), vec![value]);
        }
    }
    attributes
}

/// Drop every attribute whose key matches one of the glob patterns
pub fn apply_excludes(attributes: &mut Attributes, excludes: &[String]) {
    let patterns: Vec<glob::Pattern> = excludes
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!("Ignoring attribute exclude '{}': {}", p, e);
                None
            }
        })
        .collect();
    attributes.retain(|key, _| !patterns.iter().any(|p| p.matches(key)));
}

/// Non-loopback addresses and the names of interfaces carrying them
pub fn local_addresses() -> (Vec<IpAddr>, Vec<String>) {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let mut ips = Vec::new();
    let mut nics = Vec::new();
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!("Cannot list interface addresses: {}", e);
            return (ips, nics);
        }
    };
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(v4) = address.as_sockaddr_in() {
            IpAddr::V4(v4.ip())
        } else if let Some(v6) = address.as_sockaddr_in6() {
            IpAddr::V6(v6.ip())
        } else {
            continue;
        };
        if !ips.contains(&ip) {
            ips.push(ip);
        }
        if !nics.contains(&ifaddr.interface_name) {
            nics.push(ifaddr.interface_name);
        }
    }
    (ips, nics)
}

pub struct HostDiscovery {
    config: DiscoveryConfig,
    runner: Arc<dyn CommandRunner>,
    cpu_root: PathBuf,
    cache: RwLock<Vec<DiscoveredTarget>>,
}

impl HostDiscovery {
    pub fn new(config: DiscoveryConfig, runner: Arc<dyn CommandRunner>, cpu_root: PathBuf) -> Self {
        Self {
            config,
            runner,
            cpu_root,
            cache: RwLock::new(Vec::new()),
        }
    }

    pub fn describe(&self) -> DiscoveryDescription {
        DiscoveryDescription {
            id: HOST_TARGET_TYPE.to_string(),
            target_type: HOST_TARGET_TYPE.to_string(),
            refresh_interval: format!("{}s", self.config.interval_secs),
        }
    }

    /// Cached targets from the last successful refresh
    pub async fn targets(&self) -> DiscoveryData {
        DiscoveryData {
            targets: self.cache.read().await.clone(),
        }
    }

    async fn fqdn(&self, hostname: &str) -> String {
        match self.runner.run(&SysCommand::new("hostname").arg("-f")).await {
            Ok(output) if !output.stdout.trim().is_empty() => output.stdout.trim().to_string(),
            Ok(_) => hostname.to_string(),
            Err(e) => {
                debug!("Cannot resolve FQDN, using short hostname: {}", e);
                hostname.to_string()
            }
        }
    }

    /// Gather the host target without touching the cache
    pub async fn collect(&self) -> anyhow::Result<DiscoveredTarget> {
        let hostname = hostname::get()?.to_string_lossy().into_owned();
        let fqdn = self.fqdn(&hostname).await;

        let mut attributes = Attributes::new();
        attributes.insert("host.hostname".to_string(), vec![hostname.clone()]);
        attributes.insert("host.domainname".to_string(), vec![fqdn]);

        let (ips, nics) = local_addresses();
        let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = ips.into_iter().partition(IpAddr::is_ipv4);
        if !v4.is_empty() {
            attributes.insert("host.ipv4".to_string(), v4.iter().map(|ip| ip.to_string()).collect());
        }
        if !v6.is_empty() {
            attributes.insert("host.ipv6".to_string(), v6.iter().map(|ip| ip.to_string()).collect());
        }
        if !nics.is_empty() {
            attributes.insert("host.nic".to_string(), nics);
        }

        attributes.insert(
            "host.os.family".to_string(),
            vec![std::env::consts::OS.to_string()],
        );
        if let Some(name) = sysinfo::System::name() {
            attributes.insert("host.os.manufacturer".to_string(), vec![name]);
        }
        if let Some(version) = sysinfo::System::os_version() {
            attributes.insert("host.os.version".to_string(), vec![version]);
        }

        match CpuFreq::discover_in(&self.cpu_root).and_then(|cpus| cpus.hardware_range()) {
            Ok(range) => {
                attributes.insert(
                    "host.cpu.frequency.min".to_string(),
                    vec![range.min_mhz.to_string()],
                );
                attributes.insert(
                    "host.cpu.frequency.max".to_string(),
                    vec![range.max_mhz.to_string()],
                );
            }
            Err(e) => debug!("No CPU frequency attributes: {}", e),
        }

        attributes.extend(env_attributes(std::env::vars(), &self.config.env_list));
        apply_excludes(&mut attributes, &self.config.attribute_excludes);

        Ok(DiscoveredTarget {
            id: hostname.clone(),
            label: hostname,
            target_type: HOST_TARGET_TYPE.to_string(),
            attributes,
        })
    }

    /// Re-collect and replace the cache; the old snapshot stays on failure
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.timeout_secs);
        let outcome = tokio::time::timeout(budget, self.collect()).await;
        let seconds = started.elapsed().as_secs_f64();
        match outcome {
            Ok(Ok(target)) => {
                *self.cache.write().await = vec![target];
                metrics::record_discovery_refresh("success", seconds);
                debug!(seconds, "Host discovery refreshed");
                Ok(())
            }
            Ok(Err(e)) => {
                metrics::record_discovery_refresh("error", seconds);
                Err(e)
            }
            Err(_) => {
                metrics::record_discovery_refresh("timeout", seconds);
                anyhow::bail!("discovery refresh exceeded {:?}", budget)
            }
        }
    }

    /// Refresh immediately, then every interval until cancelled
    pub fn spawn_refresh(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.refresh().await {
                            warn!("Host discovery refresh failed: {:#}", e);
                        }
                    }
                }
            }
            info!("Host discovery stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use crate::sysfs::cpufreq::testing::standard_cpu;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_and_label_attributes() {
        let attributes = env_attributes(
            vars(&[
                ("ZONE", "eu-1"),
                ("steadybit_label_team", "payments"),
                ("STEADYBIT_LABEL_Tier", "gold"),
                ("HOME", "/root"),
                ("steadybit_label_", "ignored"),
            ]),
            &["zone".to_string(), "missing".to_string()],
        );
        assert_eq!(attributes["host.env.zone"], vec!["eu-1"]);
        assert_eq!(attributes["host.label.team"], vec!["payments"]);
        assert_eq!(attributes["host.label.tier"], vec!["gold"]);
        assert_eq!(attributes.len(), 3);
    }

    #[test]
    fn test_excludes_drop_matching_keys() {
        let mut attributes = Attributes::new();
        for key in ["host.hostname", "host.nic", "host.label.team", "host.label.tier"] {
            attributes.insert(key.to_string(), vec!["x".to_string()]);
        }
        apply_excludes(
            &mut attributes,
            &["host.label.*".to_string(), "host.nic".to_string()],
        );
        assert_eq!(attributes.keys().collect::<Vec<_>>(), vec!["host.hostname"]);
    }

    #[tokio::test]
    async fn test_refresh_fills_cache() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stdout("hostname -f", "node-1.example.com\n");
        let cpu_root = TempDir::new().unwrap();
        standard_cpu(cpu_root.path(), 0);

        let config = DiscoveryConfig {
            attribute_excludes: vec!["host.os.*".to_string()],
            ..Default::default()
        };
        let discovery = HostDiscovery::new(config, runner, cpu_root.path().to_path_buf());
        assert!(discovery.targets().await.targets.is_empty());

        discovery.refresh().await.unwrap();
        let data = discovery.targets().await;
        assert_eq!(data.targets.len(), 1);
        let target = &data.targets[0];
        assert_eq!(target.target_type, HOST_TARGET_TYPE);
        assert_eq!(target.attributes["host.domainname"], vec!["node-1.example.com"]);
        assert_eq!(target.attributes["host.cpu.frequency.min"], vec!["2800"]);
        assert_eq!(target.attributes["host.cpu.frequency.max"], vec!["3600"]);
        assert!(!target.attributes.contains_key("host.os.family"));
    }

    #[tokio::test]
    async fn test_fqdn_falls_back_to_hostname() {
        let runner = Arc::new(RecordingRunner::new());
        runner.fail("hostname -f", 1, "hostname: Name or service not known");
        let cpu_root = TempDir::new().unwrap();
        let discovery =
            HostDiscovery::new(DiscoveryConfig::default(), runner, cpu_root.path().to_path_buf());

        let target = discovery.collect().await.unwrap();
        assert_eq!(
            target.attributes["host.domainname"],
            target.attributes["host.hostname"]
        );
        assert!(!target.attributes.contains_key("host.cpu.frequency.min"));
    }

    #[test]
    fn test_describe_interval() {
        let discovery = HostDiscovery::new(
            DiscoveryConfig::default(),
            Arc::new(RecordingRunner::new()),
            PathBuf::from("/nonexistent"),
        );
        assert_eq!(discovery.describe().refresh_interval, "30s");
    }
}
