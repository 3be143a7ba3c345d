//! HTTP surface driven through the axum router without binding sockets

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use host_fault_agent::action::HostIdentity;
use host_fault_agent::agent::{build_actions, HostContext};
use host_fault_agent::config::AgentConfig;
use host_fault_agent::discovery::HostDiscovery;
use host_fault_agent::exec::{HostLauncher, RecordingRunner};
use host_fault_agent::server::{extension_router, AppState};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const CPU_FREQUENCY: &str = "com.steadybit.extension_host.cpu-frequency";

fn write_cpu(root: &Path, cpu: usize) {
    let dir = root.join(format!("cpu{}", cpu)).join("cpufreq");
    std::fs::create_dir_all(&dir).unwrap();
    for (file, khz) in [
        ("cpuinfo_min_freq", 1_000_000),
        ("cpuinfo_max_freq", 3_000_000),
        ("scaling_min_freq", 1_000_000),
        ("scaling_max_freq", 3_000_000),
        ("scaling_cur_freq", 2_000_000),
    ] {
        std::fs::write(dir.join(file), format!("{}\n", khz)).unwrap();
    }
}

fn read_khz(root: &Path, cpu: usize, file: &str) -> String {
    std::fs::read_to_string(root.join(format!("cpu{}/cpufreq/{}", cpu, file)))
        .unwrap()
        .trim()
        .to_string()
}

fn app(cpu_root: &Path) -> Router {
    let runner = Arc::new(RecordingRunner::new());
    let mut config = AgentConfig::default();
    config.tools.cpu_root = cpu_root.to_path_buf();
    let ctx = HostContext {
        runner: runner.clone(),
        launcher: HostLauncher::direct(),
        host: HostIdentity::new(vec!["node-1".to_string()]),
        agent_binary: PathBuf::from("/usr/local/bin/host-fault-agent"),
    };
    let discovery = Arc::new(HostDiscovery::new(
        config.discovery.clone(),
        runner,
        cpu_root.to_path_buf(),
    ));
    extension_router(AppState {
        actions: build_actions(&config, &ctx),
        discovery,
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_index_lists_actions_and_discovery() {
    let cpu_root = TempDir::new().unwrap();
    let app = app(cpu_root.path());

    let (status, index) = call(&app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    let paths: Vec<&str> = index["actions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["path"].as_str().unwrap())
        .collect();
    assert!(paths.contains(&"/actions/com.steadybit.extension_host.stress-io"));
    assert_eq!(index["discoveries"][0]["path"], "/discovery/host");
}

#[tokio::test]
async fn test_describe_action() {
    let cpu_root = TempDir::new().unwrap();
    let app = app(cpu_root.path());

    let (status, description) =
        call(&app, "GET", &format!("/actions/{}", CPU_FREQUENCY), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(description["id"], CPU_FREQUENCY);
    assert_eq!(description["timeControl"], "external");
    assert_eq!(description["targetType"], "com.steadybit.extension_host.host");

    let (status, _) = call(&app, "GET", "/actions/com.example.unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cpu_frequency_lifecycle_over_http() {
    let cpu_root = TempDir::new().unwrap();
    write_cpu(cpu_root.path(), 0);
    write_cpu(cpu_root.path(), 1);
    let app = app(cpu_root.path());
    let base = format!("/actions/{}", CPU_FREQUENCY);
    let execution_id = Uuid::new_v4();

    let (status, prepared) = call(
        &app,
        "POST",
        &format!("{}/prepare", base),
        Some(json!({
            "executionId": execution_id,
            "target": {"attributes": {"host.hostname": ["node-1"]}},
            "config": {"duration": 10000, "maxFrequency": 1500}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(prepared.get("error").map_or(true, Value::is_null));
    let state = prepared["state"].clone();
    assert_eq!(state["executionId"], json!(execution_id));

    let (status, started) = call(
        &app,
        "POST",
        &format!("{}/start", base),
        Some(json!({ "state": state })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(started.get("error").map_or(true, Value::is_null));
    assert_eq!(read_khz(cpu_root.path(), 1, "scaling_max_freq"), "1500000");

    let (_, status_result) = call(
        &app,
        "POST",
        &format!("{}/status", base),
        Some(json!({ "state": state })),
    )
    .await;
    assert_eq!(status_result["completed"], false);
    assert_eq!(status_result["metrics"][0]["name"], "cpu_frequency_mhz");

    let (status, _) = call(
        &app,
        "POST",
        &format!("{}/stop", base),
        Some(json!({ "state": state })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read_khz(cpu_root.path(), 1, "scaling_max_freq"), "3000000");

    let (_, status_result) = call(
        &app,
        "POST",
        &format!("{}/status", base),
        Some(json!({ "state": state })),
    )
    .await;
    assert_eq!(status_result["completed"], true);
}

#[tokio::test]
async fn test_validation_error_travels_in_envelope() {
    let cpu_root = TempDir::new().unwrap();
    write_cpu(cpu_root.path(), 0);
    let app = app(cpu_root.path());

    let (status, prepared) = call(
        &app,
        "POST",
        &format!("/actions/{}/prepare", CPU_FREQUENCY),
        Some(json!({
            "executionId": Uuid::new_v4(),
            "target": {"attributes": {"host.hostname": ["node-1"]}},
            "config": {"duration": 500}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        prepared["error"]["title"],
        "duration must be greater / equal than 1s"
    );
}

#[tokio::test]
async fn test_bad_requests() {
    let cpu_root = TempDir::new().unwrap();
    let app = app(cpu_root.path());

    let (status, _) = call(
        &app,
        "POST",
        &format!("/actions/{}/pause", CPU_FREQUENCY),
        Some(json!({ "state": { "executionId": Uuid::new_v4() } })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "POST",
        &format!("/actions/{}/prepare", CPU_FREQUENCY),
        Some(json!({ "config": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/actions/{}/stop", CPU_FREQUENCY),
        Some(json!({ "state": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"].as_str().unwrap().contains("executionId"));
}

#[tokio::test]
async fn test_discovery_endpoints() {
    let cpu_root = TempDir::new().unwrap();
    let app = app(cpu_root.path());

    let (status, description) = call(&app, "GET", "/discovery/host", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(description["refreshInterval"], "30s");

    let (status, data) = call(&app, "GET", "/discovery/host/targets", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(data["targets"].as_array().unwrap().is_empty());
}
