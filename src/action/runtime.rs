//! Action Runtime and Router
//!
//! [`ActionRuntime`] binds one [`Action`] to its execution registry and
//! converts between the JSON wire shapes and the typed state. [`ActionRouter`]
//! dispatches requests by action id.
//!
//! Key invariants:
//! - At most one live state per execution id (store-if-absent on prepare)
//! - Stop removes the entry first, then reverts outside the map
//! - User errors travel in the envelope, internal errors become transport errors

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::ActionError;
use super::registry::ExecutionRegistry;
use super::types::*;
use super::{Action, ActionDescription};
use crate::metrics;

/// Names under which this host answers; targets must match one of them
#[derive(Debug, Clone)]
pub struct HostIdentity {
    names: Vec<String>,
}

impl HostIdentity {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names: names.into_iter().map(|n| n.to_lowercase()).collect(),
        }
    }

    /// Identity of the running host (short hostname)
    pub fn current() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(vec![hostname])
    }

    /// Whether the target's `host.hostname` attribute names this host
    pub fn matches(&self, target: &Target) -> bool {
        let Some(requested) = target.attribute("host.hostname") else {
            return false;
        };
        let requested = requested.to_lowercase();
        let short = requested.split('.').next().unwrap_or_default();
        self.names.iter().any(|name| {
            name == &requested || name.split('.').next().unwrap_or_default() == short
        })
    }
}

/// Type-erased action as seen by the transport
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn id(&self) -> String;
    fn describe(&self) -> ActionDescription;
    async fn prepare(&self, body: PrepareActionRequestBody) -> Result<PrepareResult>;
    async fn start(&self, body: ActionStateRequestBody) -> Result<StartResult>;
    async fn status(&self, body: ActionStateRequestBody) -> Result<StatusResult>;
    async fn stop(&self, body: ActionStateRequestBody) -> Result<StopResult>;
    /// Stop every live execution, returning how many were stopped
    async fn stop_all(&self) -> usize;
    fn active_executions(&self) -> usize;
}

pub struct ActionRuntime<A: Action> {
    action: A,
    id: String,
    registry: ExecutionRegistry<A::State>,
    host: HostIdentity,
}

impl<A: Action> ActionRuntime<A> {
    pub fn new(action: A, host: HostIdentity) -> Self {
        let id = action.describe().id;
        Self {
            action,
            id,
            registry: ExecutionRegistry::new(),
            host,
        }
    }

    pub fn registry(&self) -> &ExecutionRegistry<A::State> {
        &self.registry
    }

    fn update_gauge(&self) {
        metrics::set_active_executions(&self.id, self.registry.len());
    }

    async fn stop_execution(&self, execution_id: Uuid) -> StopResult {
        let Some(handle) = self.registry.remove(&execution_id) else {
            debug!(
                action = %self.id,
                execution_id = %execution_id,
                "Stop for unknown execution, treating as already stopped"
            );
            return StopResult::default();
        };
        self.update_gauge();

        let mut state = handle.lock().await;
        match self.action.stop(&mut state).await {
            Ok(result) => {
                metrics::record_action_call(&self.id, "stop", outcome_of(&result.error));
                info!(action = %self.id, execution_id = %execution_id, "Execution stopped");
                result
            }
            Err(ActionError::User(error)) => {
                metrics::record_action_call(&self.id, "stop", "user_error");
                warn!(action = %self.id, execution_id = %execution_id, "Stop failed: {}", error);
                StopResult {
                    error: Some(error),
                    messages: Vec::new(),
                }
            }
            Err(ActionError::Internal(e)) => {
                // The entry is gone; surface the revert failure as a warning
                metrics::record_action_call(&self.id, "stop", "internal_error");
                warn!(action = %self.id, execution_id = %execution_id, "Revert failed: {:#}", e);
                StopResult {
                    error: None,
                    messages: vec![Message::warn(format!("revert incomplete: {:#}", e))],
                }
            }
        }
    }
}

fn outcome_of(error: &Option<UserError>) -> &'static str {
    if error.is_some() {
        "user_error"
    } else {
        "success"
    }
}

/// Serialize the typed state and stamp the execution id into it
fn render_state<S: Serialize>(execution_id: Uuid, state: &S) -> Result<Value> {
    let mut value = serde_json::to_value(state).context("Failed to serialize action state")?;
    match &mut value {
        Value::Object(map) => {
            map.insert("executionId".to_string(), json!(execution_id));
        }
        other => {
            value = json!({ "executionId": execution_id, "value": other.take() });
        }
    }
    Ok(value)
}

/// Extract the execution id from an echoed state blob
pub fn execution_id_of(state: &Value) -> Result<Uuid> {
    let raw = state
        .get("executionId")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("state carries no executionId"))?;
    Uuid::parse_str(raw).with_context(|| format!("invalid executionId '{}'", raw))
}

#[async_trait]
impl<A: Action> ActionHandler for ActionRuntime<A> {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn describe(&self) -> ActionDescription {
        self.action.describe()
    }

    async fn prepare(&self, body: PrepareActionRequestBody) -> Result<PrepareResult> {
        let execution_id = body.execution_id;
        let stub_state = json!({ "executionId": execution_id });

        if !self.host.matches(&body.target) {
            metrics::record_action_call(&self.id, "prepare", "user_error");
            return Ok(PrepareResult {
                state: stub_state,
                error: Some(UserError::errored(format!(
                    "target host '{}' is not this host",
                    body.target.attribute("host.hostname").unwrap_or("<missing>")
                ))),
                messages: Vec::new(),
            });
        }

        let state = match self.action.prepare(&body).await {
            Ok(state) => state,
            Err(ActionError::User(error)) => {
                metrics::record_action_call(&self.id, "prepare", "user_error");
                debug!(action = %self.id, execution_id = %execution_id, "Prepare rejected: {}", error);
                return Ok(PrepareResult {
                    state: stub_state,
                    error: Some(error),
                    messages: Vec::new(),
                });
            }
            Err(ActionError::Internal(e)) => {
                metrics::record_action_call(&self.id, "prepare", "internal_error");
                return Err(e);
            }
        };

        let rendered = render_state(execution_id, &state)?;
        if self.registry.insert_if_absent(execution_id, state).is_none() {
            metrics::record_action_call(&self.id, "prepare", "user_error");
            return Ok(PrepareResult {
                state: rendered,
                error: Some(UserError::errored(format!(
                    "execution {} is already prepared",
                    execution_id
                ))),
                messages: Vec::new(),
            });
        }
        self.update_gauge();
        metrics::record_action_call(&self.id, "prepare", "success");
        info!(action = %self.id, execution_id = %execution_id, "Execution prepared");

        Ok(PrepareResult {
            state: rendered,
            error: None,
            messages: Vec::new(),
        })
    }

    async fn start(&self, body: ActionStateRequestBody) -> Result<StartResult> {
        let execution_id = execution_id_of(&body.state)?;
        let Some(handle) = self.registry.get(&execution_id) else {
            metrics::record_action_call(&self.id, "start", "user_error");
            return Ok(StartResult {
                error: Some(UserError::errored(format!(
                    "execution {} is not prepared",
                    execution_id
                ))),
                ..Default::default()
            });
        };

        let mut state = handle.lock().await;
        let result = match self.action.start(&mut state).await {
            Ok(mut result) => {
                metrics::record_action_call(&self.id, "start", outcome_of(&result.error));
                result.state = Some(render_state(execution_id, &*state)?);
                result
            }
            Err(ActionError::User(error)) => {
                metrics::record_action_call(&self.id, "start", "user_error");
                warn!(action = %self.id, execution_id = %execution_id, "Start failed: {}", error);
                StartResult {
                    state: Some(render_state(execution_id, &*state)?),
                    error: Some(error),
                    ..Default::default()
                }
            }
            Err(ActionError::Internal(e)) => {
                metrics::record_action_call(&self.id, "start", "internal_error");
                return Err(e);
            }
        };
        info!(action = %self.id, execution_id = %execution_id, "Execution started");
        Ok(result)
    }

    async fn status(&self, body: ActionStateRequestBody) -> Result<StatusResult> {
        let execution_id = execution_id_of(&body.state)?;
        let Some(handle) = self.registry.get(&execution_id) else {
            debug!(action = %self.id, execution_id = %execution_id, "Status for unknown execution");
            return Ok(StatusResult::completed());
        };

        let mut state = handle.lock().await;
        match self.action.status(&mut state).await {
            Ok(result) => Ok(result),
            Err(ActionError::User(error)) => Ok(StatusResult {
                completed: true,
                error: Some(error),
                ..Default::default()
            }),
            Err(ActionError::Internal(e)) => Err(e),
        }
    }

    async fn stop(&self, body: ActionStateRequestBody) -> Result<StopResult> {
        let execution_id = execution_id_of(&body.state)?;
        Ok(self.stop_execution(execution_id).await)
    }

    async fn stop_all(&self) -> usize {
        let ids = self.registry.ids();
        for id in &ids {
            let result = self.stop_execution(*id).await;
            if let Some(error) = result.error {
                warn!(action = %self.id, execution_id = %id, "Stop on shutdown failed: {}", error);
            }
        }
        ids.len()
    }

    fn active_executions(&self) -> usize {
        self.registry.len()
    }
}

/// Dispatches requests to actions by id
#[derive(Default, Clone)]
pub struct ActionRouter {
    actions: BTreeMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Action>(&mut self, action: A, host: HostIdentity) {
        let runtime = ActionRuntime::new(action, host);
        self.actions.insert(runtime.id(), Arc::new(runtime));
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ActionHandler>> {
        self.actions.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    pub fn descriptions(&self) -> Vec<ActionDescription> {
        self.actions.values().map(|a| a.describe()).collect()
    }

    /// Revert every live execution of every action
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for action in self.actions.values() {
            stopped += action.stop_all().await;
        }
        stopped
    }
}
