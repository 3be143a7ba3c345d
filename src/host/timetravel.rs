//! timetravel
//!
//! Shifts the system clock by a fixed offset, optionally blocking NTP first
//! so the daemon does not pull the clock back. Stop undoes both in reverse
//! order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::exec::CommandRunner;
use crate::network::iptables::ntp_drop_rules;

/// Largest accepted difference between the expected and the observed clock
const MAX_DRIFT_MS: i64 = 2_000;

/// Largest accepted offset in either direction, 100 years
const MAX_OFFSET_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// Read and write access to the realtime clock
pub trait SystemClock: Send + Sync {
    fn now(&self) -> std::io::Result<DateTime<Utc>>;
    fn set(&self, time: DateTime<Utc>) -> std::io::Result<()>;
}

/// `CLOCK_REALTIME` of the host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostClock;

#[cfg(target_os = "linux")]
impl SystemClock for HostClock {
    fn now(&self) -> std::io::Result<DateTime<Utc>> {
        use nix::time::{clock_gettime, ClockId};
        let spec = clock_gettime(ClockId::CLOCK_REALTIME).map_err(std::io::Error::from)?;
        DateTime::from_timestamp(spec.tv_sec(), spec.tv_nsec() as u32).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "clock out of range")
        })
    }

    fn set(&self, time: DateTime<Utc>) -> std::io::Result<()> {
        use nix::sys::time::TimeSpec;
        use nix::time::{clock_settime, ClockId};
        let spec = TimeSpec::new(time.timestamp(), time.timestamp_subsec_nanos() as _);
        clock_settime(ClockId::CLOCK_REALTIME, spec).map_err(std::io::Error::from)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeTravelConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    offset: i64,
    #[serde(default)]
    disable_ntp: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeTravelState {
    /// Milliseconds added to the clock
    pub offset: i64,
    pub disable_ntp: bool,
    pub offset_applied: bool,
    pub ntp_blocked: bool,
}

pub struct TimeTravelAction {
    runner: Arc<dyn CommandRunner>,
    clock: Arc<dyn SystemClock>,
}

impl TimeTravelAction {
    pub fn new(runner: Arc<dyn CommandRunner>, clock: Arc<dyn SystemClock>) -> Self {
        Self { runner, clock }
    }

    /// Move the clock by `offset_ms` and check the kernel took it
    fn shift(&self, offset_ms: i64) -> Result<(), String> {
        let now = self.clock.now().map_err(|e| format!("cannot read clock: {}", e))?;
        let expected = chrono::Duration::try_milliseconds(offset_ms)
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(|| format!("offset {}ms from {} is out of range", offset_ms, now))?;
        self.clock
            .set(expected)
            .map_err(|e| format!("cannot set clock: {}", e))?;
        let actual = self
            .clock
            .now()
            .map_err(|e| format!("cannot read clock: {}", e))?;
        if (actual - expected).num_milliseconds().abs() > MAX_DRIFT_MS {
            return Err(format!(
                "time not applied, expected {} but clock reads {}",
                expected, actual
            ));
        }
        debug!(offset_ms, now = %actual, "Clock shifted");
        Ok(())
    }

    /// Install the NTP drop rules, removing any partial set on failure
    async fn block_ntp(&self) -> ActionResult<()> {
        let rules = ntp_drop_rules();
        for (index, rule) in rules.iter().enumerate() {
            if let Err(e) = self.runner.run(&rule.append()).await {
                for installed in rules[..index].iter().rev() {
                    if let Err(undo) = self.runner.run(&installed.delete()).await {
                        warn!("Removing NTP rule after failure: {}", undo);
                    }
                }
                return Err(ActionError::failed_with("failed to block NTP", e));
            }
        }
        Ok(())
    }

    async fn unblock_ntp(&self) -> Vec<String> {
        let mut failures = Vec::new();
        for rule in ntp_drop_rules().iter().rev() {
            if let Err(e) = self.runner.run(&rule.delete()).await {
                failures.push(e.to_string());
            }
        }
        failures
    }
}

#[async_trait]
impl Action for TimeTravelAction {
    type State = TimeTravelState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "timetravel",
            "Time Travel",
            "Shifts the system clock of the host",
            "state",
            TimeControl::External,
        )
        .with_parameters(vec![
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::duration("offset", "Offset", 3_600_000)
                .describe("Added to the current time, negative to travel back"),
            Parameter::boolean("disableNtp", "Disable NTP", true)
                .describe("Block NTP traffic so the clock is not corrected"),
        ])
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<TimeTravelState> {
        let config: TimeTravelConfig = params::parse_config(&request.config)?;
        params::duration_at_least_1s(config.duration)?;
        if config.offset.unsigned_abs() < 1000 {
            return Err(ActionError::errored("offset must be greater / equal than 1s"));
        }
        if config.offset.unsigned_abs() > MAX_OFFSET_MS {
            return Err(ActionError::errored("offset must not exceed 100 years"));
        }
        Ok(TimeTravelState {
            offset: config.offset,
            disable_ntp: config.disable_ntp,
            offset_applied: false,
            ntp_blocked: false,
        })
    }

    async fn start(&self, state: &mut TimeTravelState) -> ActionResult<StartResult> {
        if state.disable_ntp {
            self.block_ntp().await?;
            state.ntp_blocked = true;
        }

        if let Err(e) = self.shift(state.offset) {
            if state.ntp_blocked {
                for failure in self.unblock_ntp().await {
                    warn!("Removing NTP rule after failure: {}", failure);
                }
                state.ntp_blocked = false;
            }
            return Err(UserError::failed("failed to change system time")
                .with_detail(e)
                .into());
        }
        state.offset_applied = true;
        info!(
            offset_ms = state.offset,
            disable_ntp = state.disable_ntp,
            "Time travel started"
        );
        Ok(StartResult::default())
    }

    async fn stop(&self, state: &mut TimeTravelState) -> ActionResult<StopResult> {
        let mut messages = Vec::new();
        if state.offset_applied {
            state.offset_applied = false;
            let reverted = state
                .offset
                .checked_neg()
                .ok_or_else(|| format!("offset {}ms cannot be negated", state.offset))
                .and_then(|offset| self.shift(offset));
            if let Err(e) = reverted {
                messages.push(Message::warn(format!("revert incomplete: {}", e)));
            }
        }
        if state.ntp_blocked {
            state.ntp_blocked = false;
            for failure in self.unblock_ntp().await {
                messages.push(Message::warn(format!("revert incomplete: {}", failure)));
            }
        }
        if messages.is_empty() {
            info!("Time travel reverted");
        }
        Ok(StopResult {
            error: None,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RecordingRunner;
    use serde_json::json;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Clock that only moves when set
    struct FakeClock {
        time: Mutex<DateTime<Utc>>,
        frozen: bool,
    }

    impl FakeClock {
        fn new(frozen: bool) -> Self {
            Self {
                time: Mutex::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()),
                frozen,
            }
        }

        fn get(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    impl SystemClock for FakeClock {
        fn now(&self) -> std::io::Result<DateTime<Utc>> {
            Ok(self.get())
        }

        fn set(&self, time: DateTime<Utc>) -> std::io::Result<()> {
            if !self.frozen {
                *self.time.lock().unwrap() = time;
            }
            Ok(())
        }
    }

    fn request(config: serde_json::Value) -> PrepareActionRequestBody {
        serde_json::from_value(json!({
            "executionId": Uuid::new_v4(),
            "target": {"attributes": {}},
            "config": config,
        }))
        .unwrap()
    }

    fn action(frozen: bool) -> (TimeTravelAction, Arc<RecordingRunner>, Arc<FakeClock>) {
        let runner = Arc::new(RecordingRunner::new());
        let clock = Arc::new(FakeClock::new(frozen));
        (
            TimeTravelAction::new(runner.clone(), clock.clone()),
            runner,
            clock,
        )
    }

    #[tokio::test]
    async fn test_shift_and_revert() {
        let (action, runner, clock) = action(false);
        let before = clock.get();
        let mut state = action
            .prepare(&request(json!({"offset": 1000, "duration": 1000, "disableNtp": true})))
            .await
            .unwrap();
        assert_eq!(state.offset, 1000);
        assert!(state.disable_ntp);
        assert!(!state.offset_applied);

        action.start(&mut state).await.unwrap();
        assert!(state.offset_applied);
        assert_eq!(clock.get() - before, chrono::Duration::seconds(1));
        assert_eq!(
            runner.lines(),
            vec![
                "iptables -A OUTPUT -p udp --dport 123 -j DROP",
                "iptables -A OUTPUT -p udp --sport 123 -j DROP",
            ]
        );

        runner.clear();
        let result = action.stop(&mut state).await.unwrap();
        assert!(result.messages.is_empty());
        assert_eq!(clock.get(), before);
        assert_eq!(
            runner.lines(),
            vec![
                "iptables -D OUTPUT -p udp --sport 123 -j DROP",
                "iptables -D OUTPUT -p udp --dport 123 -j DROP",
            ]
        );

        runner.clear();
        action.stop(&mut state).await.unwrap();
        assert!(runner.calls().is_empty());
        assert_eq!(clock.get(), before);
    }

    #[tokio::test]
    async fn test_negative_offset() {
        let (action, _, clock) = action(false);
        let before = clock.get();
        let mut state = action
            .prepare(&request(json!({"offset": -7200000, "duration": 5000})))
            .await
            .unwrap();
        action.start(&mut state).await.unwrap();
        assert_eq!(before - clock.get(), chrono::Duration::hours(2));
    }

    #[tokio::test]
    async fn test_clock_not_applied_reverts_ntp() {
        let (action, runner, _) = action(true);
        let mut state = action
            .prepare(&request(json!({"offset": 60000, "duration": 1000, "disableNtp": true})))
            .await
            .unwrap();
        match action.start(&mut state).await {
            Err(ActionError::User(e)) => {
                assert_eq!(e.status, ErrorStatus::Failed);
                assert!(e.detail.unwrap().contains("time not applied"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!state.ntp_blocked);
        assert!(!state.offset_applied);
        let deletes = runner.lines().iter().filter(|l| l.contains(" -D ")).count();
        assert_eq!(deletes, 2);
    }

    #[tokio::test]
    async fn test_small_offset_rejected() {
        let (action, _, _) = action(false);
        let result = action
            .prepare(&request(json!({"offset": 999, "duration": 1000})))
            .await;
        assert!(matches!(result, Err(ActionError::User(_))));
    }

    #[tokio::test]
    async fn test_offset_beyond_100_years_rejected() {
        let (action, _, _) = action(false);
        match action
            .prepare(&request(json!({"offset": 9_000_000_000_000_000_i64, "duration": 1000})))
            .await
        {
            Err(ActionError::User(e)) => {
                assert_eq!(e.status, ErrorStatus::Errored);
                assert_eq!(e.title, "offset must not exceed 100 years");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(action
            .prepare(&request(json!({"offset": -3_153_600_000_000_i64, "duration": 1000})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_clock_is_failure_not_panic() {
        let (action, runner, clock) = action(false);
        let before = clock.get();
        let mut state = TimeTravelState {
            offset: i64::MAX,
            disable_ntp: true,
            offset_applied: false,
            ntp_blocked: false,
        };
        match action.start(&mut state).await {
            Err(ActionError::User(e)) => {
                assert_eq!(e.status, ErrorStatus::Failed);
                assert!(e.detail.unwrap().contains("out of range"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!state.ntp_blocked);
        assert_eq!(clock.get(), before);
        let deletes = runner.lines().iter().filter(|l| l.contains(" -D ")).count();
        assert_eq!(deletes, 2);

        state.offset = i64::MIN;
        state.offset_applied = true;
        let result = action.stop(&mut state).await.unwrap();
        assert!(result.messages[0].message.contains("cannot be negated"));
    }
}
