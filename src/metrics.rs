// Prometheus metrics for the host fault agent
//
// Exposes metrics on the /metrics HTTP endpoint:
// - Action calls per phase and outcome (counter)
// - Active executions per action (gauge)
// - Discovery refreshes (counter, histogram)
// - Current CPU frequency while a frequency attack runs (gauge)

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, IntCounterVec, IntGauge, IntGaugeVec, Registry, TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Action metrics
    pub static ref ACTION_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("action_calls_total", "Action lifecycle calls by phase and outcome"),
        &["action", "phase", "outcome"]
    ).expect("Failed to create action calls metric");

    pub static ref ACTIVE_EXECUTIONS: IntGaugeVec = IntGaugeVec::new(
        prometheus::Opts::new("active_executions", "Executions currently held in the registry"),
        &["action"]
    ).expect("Failed to create active executions metric");

    // Discovery metrics
    pub static ref DISCOVERY_REFRESH_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("discovery_refresh_total", "Host discovery refreshes by outcome"),
        &["outcome"]
    ).expect("Failed to create discovery refresh metric");

    pub static ref DISCOVERY_REFRESH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("discovery_refresh_duration_seconds", "Duration of a host discovery refresh"),
    ).expect("Failed to create discovery duration metric");

    // Host metrics
    pub static ref CPU_FREQUENCY_MHZ: IntGauge = IntGauge::new(
        "cpu_frequency_mhz",
        "Current frequency of the first CPU while a frequency attack runs"
    ).expect("Failed to create CPU frequency metric");
}

/// Register all collectors; repeated calls are no-ops
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTION_CALLS_TOTAL.clone()),
        Box::new(ACTIVE_EXECUTIONS.clone()),
        Box::new(DISCOVERY_REFRESH_TOTAL.clone()),
        Box::new(DISCOVERY_REFRESH_DURATION_SECONDS.clone()),
        Box::new(CPU_FREQUENCY_MHZ.clone()),
    ];
    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn record_action_call(action: &str, phase: &str, outcome: &str) {
    ACTION_CALLS_TOTAL
        .with_label_values(&[action, phase, outcome])
        .inc();
}

pub fn set_active_executions(action: &str, count: usize) {
    ACTIVE_EXECUTIONS
        .with_label_values(&[action])
        .set(count as i64);
}

pub fn record_discovery_refresh(outcome: &str, seconds: f64) {
    DISCOVERY_REFRESH_TOTAL.with_label_values(&[outcome]).inc();
    DISCOVERY_REFRESH_DURATION_SECONDS.observe(seconds);
}

pub fn set_cpu_frequency(mhz: u64) {
    CPU_FREQUENCY_MHZ.set(mhz as i64);
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}
