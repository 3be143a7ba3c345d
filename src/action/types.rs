//! Action Wire Types
//!
//! Request and result envelopes exchanged with the orchestrator for the
//! prepare/start/status/stop protocol, plus the user-error, message and
//! metric records carried inside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Severity of a user-facing error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStatus {
    /// The experiment could not run (validation, unsupported host)
    Errored,
    /// The experiment ran and the attack failed
    Failed,
}

/// Structured error returned to the orchestrator inside a result envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserError {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub status: ErrorStatus,
}

impl UserError {
    /// Validation or environment error raised during prepare
    pub fn errored(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            status: ErrorStatus::Errored,
        }
    }

    /// Runtime failure raised during start/status/stop
    pub fn failed(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: None,
            status: ErrorStatus::Failed,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.title, detail),
            None => write!(f, "{}", self.title),
        }
    }
}

/// Log level of a message attached to a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Message surfaced in the orchestrator's experiment log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
    pub level: MessageLevel,
}

impl Message {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: MessageLevel::Info,
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: MessageLevel::Warn,
        }
    }
}

/// Sampled metric attached to a start/status result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub metric: HashMap<String, String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub value: f64,
}

impl Metric {
    pub fn now(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            metric: HashMap::new(),
            timestamp: chrono::Utc::now(),
            value,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metric.insert(key.into(), value.into());
        self
    }
}

/// Target the action was scheduled against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub attributes: HashMap<String, Vec<String>>,
}

impl Target {
    /// First value of an attribute, if any
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }
}

/// Endpoint the orchestrator forbids the agent from cutting off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictedEndpoint {
    #[serde(default)]
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub port_min: u16,
    #[serde(default = "max_port")]
    pub port_max: u16,
}

fn max_port() -> u16 {
    u16::MAX
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default)]
    pub restricted_endpoints: Vec<RestrictedEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareActionRequestBody {
    pub execution_id: Uuid,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub execution_context: ExecutionContext,
}

/// Body of start, status and stop calls: the state echoed back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStateRequestBody {
    pub state: Value,
}

pub type StartActionRequestBody = ActionStateRequestBody;
pub type ActionStatusRequestBody = ActionStateRequestBody;
pub type StopActionRequestBody = ActionStateRequestBody;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareResult {
    pub state: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusResult {
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<Metric>,
}

impl StatusResult {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn completed() -> Self {
        Self {
            completed: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UserError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}
