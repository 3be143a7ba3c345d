//! Action Runtime
//!
//! Every fault-injection capability is an [`Action`]: a descriptor plus the
//! four-step prepare/start/status/stop lifecycle. The runtime wraps each action
//! with an execution registry and exposes it to the transport through the
//! type-erased [`ActionHandler`].
//!
//! # Lifecycle
//!
//! 1. `prepare` validates the config, captures the revert snapshot, performs no mutation
//! 2. `start` mutates the host and sets the applied latch
//! 3. `status` observes the mutation (child exit, current frequency)
//! 4. `stop` reverts; a no-op when nothing is applied

pub mod error;
pub mod params;
pub mod registry;
pub mod runtime;
pub mod types;

pub use error::{ActionError, ActionResult};
pub use params::{Parameter, ParameterKind};
pub use registry::ExecutionRegistry;
pub use runtime::{ActionHandler, ActionRouter, ActionRuntime, HostIdentity};
pub use types::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Prefix shared by all action ids
pub const ACTION_ID_PREFIX: &str = "com.steadybit.extension_host";

/// Target type every action attacks
pub const HOST_TARGET_TYPE: &str = "com.steadybit.extension_host.host";

/// Build the full dotted id of an action
pub fn action_id(name: &str) -> String {
    format!("{}.{}", ACTION_ID_PREFIX, name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Attack,
    Check,
    LoadTest,
    Other,
}

/// Who decides when an execution ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeControl {
    /// The orchestrator calls stop after the configured duration
    External,
    /// The action reports completion through status
    Internal,
    /// The action completes within start
    Instantaneous,
}

/// Optional UI hint rendered next to an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Widget {
    LineChart { title: String, metric: String },
    Log { title: String },
}

/// Read-only metadata of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionDescription {
    pub id: String,
    pub label: String,
    pub description: String,
    pub version: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub kind: ActionKind,
    pub time_control: TimeControl,
    pub target_type: String,
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub widgets: Vec<Widget>,
    /// Interval at which the orchestrator polls status, absent when status is not polled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_call_interval: Option<String>,
    pub has_stop: bool,
}

impl ActionDescription {
    /// Attack descriptor with the host target and the crate version
    pub fn attack(
        name: &str,
        label: &str,
        description: &str,
        category: &str,
        time_control: TimeControl,
    ) -> Self {
        Self {
            id: action_id(name),
            label: label.to_string(),
            description: description.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            category: category.to_string(),
            icon: None,
            kind: ActionKind::Attack,
            time_control,
            target_type: HOST_TARGET_TYPE.to_string(),
            parameters: Vec::new(),
            widgets: Vec::new(),
            status_call_interval: match time_control {
                TimeControl::Instantaneous => None,
                _ => Some("1s".to_string()),
            },
            has_stop: time_control != TimeControl::Instantaneous,
        }
    }

    pub fn with_icon(mut self, icon: &str) -> Self {
        self.icon = Some(icon.to_string());
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters
            .into_iter()
            .enumerate()
            .map(|(order, parameter)| parameter.order(order as u32))
            .collect();
        self
    }

    pub fn with_widget(mut self, widget: Widget) -> Self {
        self.widgets.push(widget);
        self
    }
}

/// One fault-injection capability
///
/// `State` is the per-execution record: the parsed config, the revert
/// snapshot and the applied latch. Fields that cannot be serialized (child
/// handles, cancellation tokens) are `#[serde(skip)]` and live only in the
/// registry copy.
#[async_trait]
pub trait Action: Send + Sync + 'static {
    type State: Serialize + Send + Sync + 'static;

    fn describe(&self) -> ActionDescription;

    /// Validate and snapshot; must not mutate the host
    async fn prepare(&self, request: &PrepareActionRequestBody) -> ActionResult<Self::State>;

    /// Apply the mutation, cleaning up any partial mutation on failure
    async fn start(&self, state: &mut Self::State) -> ActionResult<StartResult>;

    /// Observe the mutation; the default never completes
    async fn status(&self, _state: &mut Self::State) -> ActionResult<StatusResult> {
        Ok(StatusResult::running())
    }

    /// Revert everything recorded in the state; idempotent
    async fn stop(&self, state: &mut Self::State) -> ActionResult<StopResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_id_is_dotted() {
        assert_eq!(
            action_id("stress-cpu"),
            "com.steadybit.extension_host.stress-cpu"
        );
    }

    #[test]
    fn test_instantaneous_attack_has_no_stop() {
        let description = ActionDescription::attack(
            "shutdown",
            "Shutdown Host",
            "Reboots or powers off the host",
            "state",
            TimeControl::Instantaneous,
        );
        assert!(!description.has_stop);
        assert!(description.status_call_interval.is_none());
    }

    #[test]
    fn test_parameters_are_ordered() {
        let description = ActionDescription::attack(
            "stress-cpu",
            "Stress CPU",
            "Generates CPU load",
            "resource",
            TimeControl::Internal,
        )
        .with_parameters(vec![
            Parameter::duration("duration", "Duration", 30_000),
            Parameter::percentage("cpuLoad", "Load on CPU", 100),
        ]);

        assert_eq!(description.parameters[0].order, 0);
        assert_eq!(description.parameters[1].order, 1);
    }
}
