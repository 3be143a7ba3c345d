//! Action parameter descriptors and config parsing helpers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

use super::error::{ActionError, ActionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Duration,
    Integer,
    Percentage,
    Boolean,
    String,
    StringArray,
    Bitrate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterOption {
    pub label: String,
    pub value: String,
}

/// One named, typed input of an action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    pub required: bool,
    pub advanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<ParameterOption>,
    pub order: u32,
}

impl Parameter {
    fn new(name: &str, label: &str, kind: ParameterKind) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            description: None,
            kind,
            default_value: None,
            required: false,
            advanced: false,
            min_value: None,
            max_value: None,
            options: Vec::new(),
            order: 0,
        }
    }

    /// Duration parameter, values in milliseconds
    pub fn duration(name: &str, label: &str, default_ms: u64) -> Self {
        let mut parameter = Self::new(name, label, ParameterKind::Duration);
        parameter.default_value = Some(Value::from(default_ms));
        parameter.required = true;
        parameter
    }

    pub fn integer(name: &str, label: &str, default: i64) -> Self {
        let mut parameter = Self::new(name, label, ParameterKind::Integer);
        parameter.default_value = Some(Value::from(default));
        parameter
    }

    pub fn percentage(name: &str, label: &str, default: i64) -> Self {
        let mut parameter = Self::new(name, label, ParameterKind::Percentage);
        parameter.default_value = Some(Value::from(default));
        parameter.min_value = Some(0);
        parameter.max_value = Some(100);
        parameter
    }

    pub fn boolean(name: &str, label: &str, default: bool) -> Self {
        let mut parameter = Self::new(name, label, ParameterKind::Boolean);
        parameter.default_value = Some(Value::from(default));
        parameter
    }

    pub fn string(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::String)
    }

    pub fn string_array(name: &str, label: &str) -> Self {
        Self::new(name, label, ParameterKind::StringArray)
    }

    pub fn bitrate(name: &str, label: &str, default: &str) -> Self {
        let mut parameter = Self::new(name, label, ParameterKind::Bitrate);
        parameter.default_value = Some(Value::from(default));
        parameter.required = true;
        parameter
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn default_str(mut self, value: &str) -> Self {
        self.default_value = Some(Value::from(value));
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn advanced(mut self) -> Self {
        self.advanced = true;
        self
    }

    pub fn range(mut self, min: i64, max: i64) -> Self {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    pub fn option(mut self, label: &str, value: &str) -> Self {
        self.options.push(ParameterOption {
            label: label.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub(crate) fn order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }
}

/// Deserialize the heterogeneous config map into the action's typed record
pub fn parse_config<T: DeserializeOwned>(config: &Map<String, Value>) -> ActionResult<T> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| ActionError::errored_with("invalid action configuration", e))
}

/// Convert a millisecond duration, rejecting anything below one second
pub fn duration_at_least_1s(duration_ms: u64) -> ActionResult<Duration> {
    if duration_ms < 1000 {
        return Err(ActionError::errored(
            "duration must be greater / equal than 1s",
        ));
    }
    Ok(Duration::from_millis(duration_ms))
}

/// Accept numbers or numeric strings for fields the UI may send either way
pub mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        Float(f64),
        String(String),
    }

    pub fn u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match NumberOrString::deserialize(deserializer)? {
            NumberOrString::Number(n) => Ok(n),
            NumberOrString::Float(f) if f >= 0.0 => Ok(f as u64),
            NumberOrString::Float(f) => Err(serde::de::Error::custom(format!(
                "expected a non-negative number, got {}",
                f
            ))),
            NumberOrString::String(s) => s
                .trim()
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("expected a number, got '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        #[serde(deserialize_with = "lenient::u64")]
        duration: u64,
        #[serde(default)]
        fail_on_oom_kill: bool,
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_duration_boundary() {
        assert!(duration_at_least_1s(999).is_err());
        assert_eq!(
            duration_at_least_1s(1000).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_duration_error_message() {
        match duration_at_least_1s(500) {
            Err(ActionError::User(err)) => {
                assert_eq!(err.title, "duration must be greater / equal than 1s")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_config_accepts_numeric_strings() {
        let sample: Sample = parse_config(&map(json!({"duration": "1500"}))).unwrap();
        assert_eq!(sample.duration, 1500);
        assert!(!sample.fail_on_oom_kill);
    }

    #[test]
    fn test_parse_config_rejects_missing_field() {
        let result: ActionResult<Sample> = parse_config(&map(json!({"failOnOomKill": true})));
        assert!(matches!(result, Err(ActionError::User(_))));
    }

    #[test]
    fn test_percentage_has_bounds() {
        let parameter = Parameter::percentage("cpuLoad", "Load", 100);
        assert_eq!(parameter.min_value, Some(0));
        assert_eq!(parameter.max_value, Some(100));
    }
}
