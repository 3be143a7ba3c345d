//! Hostname resolution through `dig`

use std::net::IpAddr;
use tracing::debug;

use super::FilterError;
use crate::exec::{CommandError, CommandRunner, SysCommand, DIG_TIMEOUT};

/// Build the `dig -f-` batch: one A and one AAAA query per hostname
pub fn dig_batch(hostnames: &[String]) -> String {
    let mut batch = String::new();
    for hostname in hostnames {
        batch.push_str(&format!("{} A\n{} AAAA\n", hostname, hostname));
    }
    batch
}

/// Resolve hostnames to addresses; literal IPs pass through untouched
///
/// `dig` runs once per hostname since `+short` answers carry no owner name.
/// `+timeout=4` applies per query, so each call is allowed 4 s per query.
/// Every hostname must yield at least one address.
pub async fn resolve_hostnames(
    runner: &dyn CommandRunner,
    hostnames: &[String],
) -> Result<Vec<IpAddr>, FilterError> {
    let mut addresses = Vec::new();
    let mut missing = Vec::new();
    for hostname in hostnames {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            addresses.push(ip);
            continue;
        }
        let resolved = dig(runner, hostname).await?;
        debug!(hostname = %hostname, addresses = ?resolved, "Resolved hostname");
        if resolved.is_empty() {
            missing.push(hostname.clone());
        }
        addresses.extend(resolved);
    }

    if !missing.is_empty() {
        return Err(FilterError::Resolve {
            hostnames: missing.join(", "),
            reason: "no addresses found".to_string(),
        });
    }
    addresses.sort();
    addresses.dedup();
    Ok(addresses)
}

async fn dig(runner: &dyn CommandRunner, hostname: &str) -> Result<Vec<IpAddr>, FilterError> {
    let batch = dig_batch(&[hostname.to_string()]);
    let queries = u32::try_from(batch.lines().count()).unwrap_or(u32::MAX);
    let command = SysCommand::new("dig")
        .args(["-f-", "+timeout=4", "+short", "+nottlid", "+noclass"])
        .stdin(batch)
        .timeout(DIG_TIMEOUT.saturating_mul(queries));

    let output = runner.run(&command).await.map_err(|e| FilterError::Resolve {
        hostnames: hostname.to_string(),
        reason: match &e {
            CommandError::Timeout { .. } => "dig timed out".to_string(),
            other => other.to_string(),
        },
    })?;

    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.trim().parse::<IpAddr>().ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{RecordingRunner, Scripted};

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dig_batch() {
        assert_eq!(
            dig_batch(&names(&["a.example", "b.example"])),
            "a.example A\na.example AAAA\nb.example A\nb.example AAAA\n"
        );
    }

    #[tokio::test]
    async fn test_literal_ips_skip_dig() {
        let runner = RecordingRunner::new();
        let result = resolve_hostnames(&runner, &names(&["10.0.0.1", "::1"]))
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dig_invocation_and_cname_skipped() {
        let runner = RecordingRunner::new();
        runner.stdout("dig", "edge.example.net.\n10.0.0.7\n");
        let result = resolve_hostnames(&runner, &names(&["www.example"]))
            .await
            .unwrap();
        assert_eq!(result, vec!["10.0.0.7".parse::<IpAddr>().unwrap()]);

        let calls = runner.calls();
        assert_eq!(
            calls[0].command_line(),
            "dig -f- +timeout=4 +short +nottlid +noclass"
        );
        assert_eq!(
            calls[0].stdin.as_deref(),
            Some("www.example A\nwww.example AAAA\n")
        );
    }

    #[tokio::test]
    async fn test_dig_timeout_is_resolution_error() {
        let runner = RecordingRunner::new();
        runner.respond("dig", Scripted::Timeout);
        let err = resolve_hostnames(&runner, &names(&["slow.example"]))
            .await
            .unwrap_err();
        assert!(matches!(err, FilterError::Resolve { .. }));
        assert!(err.to_string().contains("dig timed out"));
    }

    #[tokio::test]
    async fn test_one_dig_call_per_hostname() {
        let runner = RecordingRunner::new();
        runner.respond_to_stdin("dig", "a.example", Scripted::Output("10.0.0.1\n".to_string()));
        runner.respond_to_stdin("dig", "b.example", Scripted::Output("fd00::2\n".to_string()));
        let result = resolve_hostnames(&runner, &names(&["a.example", "10.9.9.9", "b.example"]))
            .await
            .unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(
            runner.stdin_of("dig"),
            vec!["a.example A\na.example AAAA\n", "b.example A\nb.example AAAA\n"]
        );
    }

    #[tokio::test]
    async fn test_partially_unresolved_names_the_missing_host() {
        let runner = RecordingRunner::new();
        runner.respond_to_stdin("dig", "www.example", Scripted::Output("10.0.0.7\n".to_string()));
        let err = resolve_hostnames(&runner, &names(&["www.example", "typo.invalid"]))
            .await
            .unwrap_err();
        match err {
            FilterError::Resolve { hostnames, reason } => {
                assert_eq!(hostnames, "typo.invalid");
                assert_eq!(reason, "no addresses found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_answer_is_error() {
        let runner = RecordingRunner::new();
        let err = resolve_hostnames(&runner, &names(&["nothing.example"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no addresses found"));
    }
}
