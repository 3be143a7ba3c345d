//! cpu-frequency
//!
//! Pins the scaling limits of every CPU to the requested range and restores
//! the limits captured at prepare on stop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::action::params::{self, lenient, Parameter};
use crate::action::*;
use crate::metrics;
use crate::sysfs::{CpuFreq, CpuFreqError, CpuLimits, FrequencyRange};

pub const CPU_FREQUENCY_METRIC: &str = "cpu_frequency_mhz";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CpuFrequencyConfig {
    #[serde(deserialize_with = "lenient::u64")]
    duration: u64,
    #[serde(default, alias = "min", deserialize_with = "optional_mhz")]
    min_frequency: Option<u64>,
    #[serde(default, alias = "max", deserialize_with = "optional_mhz")]
    max_frequency: Option<u64>,
}

fn optional_mhz<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    lenient::u64(deserializer).map(Some)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuFrequencyState {
    pub requested: FrequencyRange,
    /// Per-CPU limits before start, in kHz
    pub original: Vec<CpuLimits>,
    pub applied: bool,
}

pub struct CpuFrequencyAction {
    cpu_root: PathBuf,
}

impl CpuFrequencyAction {
    pub fn new(cpu_root: PathBuf) -> Self {
        Self { cpu_root }
    }

    fn cpus(&self) -> Result<CpuFreq, CpuFreqError> {
        CpuFreq::discover_in(&self.cpu_root)
    }
}

#[async_trait]
impl Action for CpuFrequencyAction {
    type State = CpuFrequencyState;

    fn describe(&self) -> ActionDescription {
        ActionDescription::attack(
            "cpu-frequency",
            "Limit CPU Frequency",
            "Restricts the scaling frequency of all CPUs",
            "resource",
            TimeControl::External,
        )
        .with_parameters(vec![
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::integer("minFrequency", "Minimum Frequency (MHz)", 0)
                .describe("Defaults to the hardware minimum"),
            Parameter::integer("maxFrequency", "Maximum Frequency (MHz)", 0)
                .describe("Defaults to the hardware maximum"),
        ])
        .with_widget(Widget::LineChart {
            title: "CPU Frequency".to_string(),
            metric: CPU_FREQUENCY_METRIC.to_string(),
        })
    }

    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<CpuFrequencyState> {
        let config: CpuFrequencyConfig = params::parse_config(&request.config)?;
        params::duration_at_least_1s(config.duration)?;

        let cpus = self
            .cpus()
            .map_err(|e| ActionError::errored_with("CPU frequency scaling is not available", e))?;
        let hardware = cpus
            .hardware_range()
            .map_err(|e| ActionError::errored_with("cannot read hardware frequency range", e))?;
        let requested = cpus
            .validate(
                config.min_frequency.unwrap_or(hardware.min_mhz),
                config.max_frequency.unwrap_or(hardware.max_mhz),
            )
            .map_err(|e| ActionError::errored(e.to_string()))?;
        let original = cpus
            .snapshot()
            .map_err(|e| ActionError::errored_with("cannot read current scaling limits", e))?;

        Ok(CpuFrequencyState {
            requested,
            original,
            applied: false,
        })
    }

    async fn start(&self, state: &mut CpuFrequencyState) -> ActionResult<StartResult> {
        let cpus = self
            .cpus()
            .map_err(|e| ActionError::failed_with("CPU frequency scaling is not available", e))?;
        if let Err(e) = cpus.set_limits(state.requested.min_mhz, state.requested.max_mhz) {
            if let Err(restore) = cpus.restore(&state.original) {
                warn!("Restoring scaling limits after failed start: {}", restore);
            }
            return Err(ActionError::failed_with("failed to set CPU frequency", e));
        }
        state.applied = true;
        info!(
            min_mhz = state.requested.min_mhz,
            max_mhz = state.requested.max_mhz,
            "CPU frequency limited"
        );
        Ok(StartResult::default())
    }

    async fn status(&self, _state: &mut CpuFrequencyState) -> ActionResult<StatusResult> {
        let mut result = StatusResult::running();
        match self.cpus().and_then(|cpus| cpus.current_frequency_mhz()) {
            Ok(mhz) => {
                metrics::set_cpu_frequency(mhz);
                result
                    .metrics
                    .push(Metric::now(CPU_FREQUENCY_METRIC, mhz as f64).with_label("cpu", "cpu0"));
            }
            Err(e) => warn!("Cannot read current CPU frequency: {}", e),
        }
        Ok(result)
    }

    async fn stop(&self, state: &mut CpuFrequencyState) -> ActionResult<StopResult> {
        if !state.applied {
            return Ok(StopResult::default());
        }
        state.applied = false;
        match self.cpus().and_then(|cpus| cpus.restore(&state.original)) {
            Ok(()) => {
                info!("CPU frequency restored");
                Ok(StopResult::default())
            }
            Err(e) => Ok(StopResult {
                error: None,
                messages: vec![Message::warn(format!("revert incomplete: {}", e))],
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::cpufreq::testing::*;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn host() -> (TempDir, CpuFrequencyAction) {
        let dir = TempDir::new().unwrap();
        standard_cpu(dir.path(), 0);
        standard_cpu(dir.path(), 1);
        let action = CpuFrequencyAction::new(dir.path().to_path_buf());
        (dir, action)
    }

    fn request(config: serde_json::Value) -> PrepareActionRequestBody {
        serde_json::from_value(json!({
            "executionId": Uuid::new_v4(),
            "target": {"attributes": {}},
            "config": config,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_limit_and_restore() {
        let (dir, action) = host();
        let mut state = action
            .prepare(&request(json!({"duration": 10000, "min": 2900, "max": 3000})))
            .await
            .unwrap();
        assert_eq!(state.original.len(), 2);
        assert_eq!(state.original[0].max_khz, 3_600_000);

        action.start(&mut state).await.unwrap();
        for cpu in 0..2 {
            assert_eq!(read(dir.path(), cpu, "scaling_max_freq"), "3000000");
            assert_eq!(read(dir.path(), cpu, "scaling_min_freq"), "2900000");
        }

        let status = action.status(&mut state).await.unwrap();
        assert_eq!(status.metrics[0].name, CPU_FREQUENCY_METRIC);
        assert_eq!(status.metrics[0].value, 3100.0);

        action.stop(&mut state).await.unwrap();
        for cpu in 0..2 {
            assert_eq!(read(dir.path(), cpu, "scaling_max_freq"), "3600000");
            assert_eq!(read(dir.path(), cpu, "scaling_min_freq"), "2800000");
        }
    }

    #[tokio::test]
    async fn test_stop_restores_each_cpu_exactly() {
        let (dir, action) = host();
        write_cpu(dir.path(), 0, &[("scaling_max_freq", 3_600_500)]);
        write_cpu(
            dir.path(),
            1,
            &[("scaling_min_freq", 3_000_000), ("scaling_max_freq", 3_300_000)],
        );

        let mut state = action
            .prepare(&request(json!({"duration": 10000, "min": 2900, "max": 3000})))
            .await
            .unwrap();
        action.start(&mut state).await.unwrap();
        assert_eq!(read(dir.path(), 1, "scaling_min_freq"), "2900000");

        action.stop(&mut state).await.unwrap();
        assert_eq!(read(dir.path(), 0, "scaling_min_freq"), "2800000");
        assert_eq!(read(dir.path(), 0, "scaling_max_freq"), "3600500");
        assert_eq!(read(dir.path(), 1, "scaling_min_freq"), "3000000");
        assert_eq!(read(dir.path(), 1, "scaling_max_freq"), "3300000");
    }

    #[tokio::test]
    async fn test_below_hardware_minimum() {
        let (dir, action) = host();
        match action
            .prepare(&request(json!({"duration": 10000, "min": 2700, "max": 3000})))
            .await
        {
            Err(ActionError::User(e)) => assert_eq!(
                e.title,
                "requested minimum frequency 2700 MHz is below hardware minimum 2800 MHz"
            ),
            other => panic!("unexpected {:?}", other.map(|s| s.requested)),
        }
        assert_eq!(read(dir.path(), 0, "scaling_min_freq"), "2800000");
    }

    #[tokio::test]
    async fn test_hardware_minimum_accepted() {
        let (_dir, action) = host();
        let state = action
            .prepare(&request(json!({"duration": 10000, "minFrequency": 2800})))
            .await
            .unwrap();
        assert_eq!(
            state.requested,
            FrequencyRange {
                min_mhz: 2800,
                max_mhz: 3600
            }
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_writes_nothing() {
        let (dir, action) = host();
        let mut state = action
            .prepare(&request(json!({"duration": 10000, "max": 3000})))
            .await
            .unwrap();
        std::fs::write(dir.path().join("cpu0/cpufreq/scaling_max_freq"), "3200000\n").unwrap();
        action.stop(&mut state).await.unwrap();
        assert_eq!(read(dir.path(), 0, "scaling_max_freq"), "3200000");
    }

    #[tokio::test]
    async fn test_missing_cpufreq_is_environment_error() {
        let dir = TempDir::new().unwrap();
        let action = CpuFrequencyAction::new(dir.path().to_path_buf());
        let result = action.prepare(&request(json!({"duration": 10000}))).await;
        assert!(matches!(result, Err(ActionError::User(_))));
    }
}
