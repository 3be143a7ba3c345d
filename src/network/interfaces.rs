//! Network interface enumeration via `ip`

use serde::Deserialize;

use super::NetworkError;
use crate::exec::{CommandRunner, SysCommand};

#[derive(Debug, Deserialize)]
struct Link {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    link_type: Option<String>,
}

impl Link {
    fn is_loopback(&self) -> bool {
        self.ifname == "lo"
            || self.flags.iter().any(|f| f == "LOOPBACK")
            || self.link_type.as_deref() == Some("loopback")
    }

    fn is_up(&self) -> bool {
        self.flags.iter().any(|f| f == "UP")
    }
}

/// Parse `ip -json link show` into non-loopback interfaces that are UP
pub fn parse_up_interfaces(json: &str) -> Result<Vec<String>, NetworkError> {
    let links: Vec<Link> = serde_json::from_str(json)
        .map_err(|e| NetworkError::Parse(format!("ip -json link show: {}", e)))?;
    Ok(links
        .into_iter()
        .filter(|l| l.is_up() && !l.is_loopback())
        .map(|l| l.ifname)
        .collect())
}

pub async fn list_up_interfaces(runner: &dyn CommandRunner) -> Result<Vec<String>, NetworkError> {
    let output = runner
        .run(&SysCommand::new("ip").args(["-json", "link", "show"]))
        .await?;
    parse_up_interfaces(&output.stdout)
}

/// Device of the first default route in `ip route show default` output
pub fn parse_default_route_device(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "dev" {
                return tokens.next().map(str::to_string);
            }
        }
        None
    })
}

/// Pick the interface a NIC flap targets when none was given
///
/// Default-route device first, then `eno*`, `ens*`, `eth*`, then any
/// non-loopback interface.
pub async fn pick_flap_interface(runner: &dyn CommandRunner) -> Result<String, NetworkError> {
    if let Ok(output) = runner
        .run(&SysCommand::new("ip").args(["route", "show", "default"]))
        .await
    {
        if let Some(device) = parse_default_route_device(&output.stdout) {
            return Ok(device);
        }
    }

    let interfaces = list_up_interfaces(runner).await?;
    choose_preferred(&interfaces).ok_or(NetworkError::NoInterface)
}

fn choose_preferred(interfaces: &[String]) -> Option<String> {
    ["eno", "ens", "eth"]
        .iter()
        .find_map(|prefix| interfaces.iter().find(|i| i.starts_with(prefix)))
        .or_else(|| interfaces.iter().find(|i| i.as_str() != "lo"))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;

    const LINKS: &str = r#"[
        {"ifindex":1,"ifname":"lo","flags":["LOOPBACK","UP","LOWER_UP"],"link_type":"loopback"},
        {"ifindex":2,"ifname":"eth0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"link_type":"ether"},
        {"ifindex":3,"ifname":"docker0","flags":["NO-CARRIER","BROADCAST","MULTICAST","UP"],"link_type":"ether"},
        {"ifindex":4,"ifname":"wlan0","flags":["BROADCAST","MULTICAST"],"link_type":"ether"}
    ]"#;

    #[test]
    fn test_parse_up_interfaces() {
        assert_eq!(parse_up_interfaces(LINKS).unwrap(), vec!["eth0", "docker0"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_up_interfaces("not json").is_err());
    }

    #[test]
    fn test_default_route_device() {
        let output = "default via 10.0.2.2 dev enp0s3 proto dhcp src 10.0.2.15 metric 100\n";
        assert_eq!(parse_default_route_device(output), Some("enp0s3".to_string()));
        assert_eq!(parse_default_route_device(""), None);
    }

    #[tokio::test]
    async fn test_pick_prefers_default_route() {
        let runner = RecordingRunner::new();
        runner.stdout("ip route show default", "default via 10.0.0.1 dev bond0\n");
        assert_eq!(pick_flap_interface(&runner).await.unwrap(), "bond0");
    }

    #[tokio::test]
    async fn test_pick_falls_back_to_preferred_prefix() {
        let runner = RecordingRunner::new();
        runner.stdout(
            "ip -json link show",
            r#"[{"ifname":"docker0","flags":["UP"]},{"ifname":"ens5","flags":["UP"]}]"#,
        );
        assert_eq!(pick_flap_interface(&runner).await.unwrap(), "ens5");
    }

    #[tokio::test]
    async fn test_pick_any_non_loopback() {
        let runner = RecordingRunner::new();
        runner.stdout("ip -json link show", r#"[{"ifname":"wg0","flags":["UP"]}]"#);
        assert_eq!(pick_flap_interface(&runner).await.unwrap(), "wg0");
    }

    #[tokio::test]
    async fn test_pick_nothing() {
        let runner = RecordingRunner::new();
        runner.stdout("ip -json link show", "[]");
        assert!(matches!(
            pick_flap_interface(&runner).await,
            Err(NetworkError::NoInterface)
        ));
    }
}
