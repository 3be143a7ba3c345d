// Configuration File Support
//
// Agent configuration: built-in defaults, then an optional TOML file passed
// with --config, then STEADYBIT_* environment overrides.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::exec::DEFAULT_TOOLS;
use crate::logging::{LogFormat, LogLevel};
use crate::sysfs::{DEFAULT_CPU_ROOT, DEFAULT_PROC_ROOT};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Listening ports
    pub http: HttpConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Host discovery
    pub discovery: DiscoveryConfig,

    /// Host tools and kernel interfaces
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Action and discovery endpoints
    pub port: u16,

    /// Liveness, readiness and metrics
    pub health_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            health_port: 8081,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<LogLevel> {
        self.level.parse().map_err(|e: String| anyhow::anyhow!(e))
    }

    pub fn format(&self) -> Result<LogFormat> {
        self.format.parse().map_err(|e: String| anyhow::anyhow!(e))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Seconds between two refreshes
    pub interval_secs: u64,

    /// Budget of one refresh
    pub timeout_secs: u64,

    /// Environment variables published as `host.env.<name>`
    pub env_list: Vec<String>,

    /// Glob patterns of attribute keys to drop
    pub attribute_excludes: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_secs: 30,
            env_list: Vec::new(),
            attribute_excludes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Programs allowed in addition to the built-in host tools
    pub extra_allowed: Vec<String>,

    /// procfs mount, `/proc` outside of tests
    pub proc_root: PathBuf,

    /// CPU device tree holding the cpufreq directories
    pub cpu_root: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            extra_allowed: Vec::new(),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            cpu_root: PathBuf::from(DEFAULT_CPU_ROOT),
        }
    }
}

impl ToolsConfig {
    /// Built-in tools plus the configured extras
    pub fn allowed_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect();
        for extra in &self.extra_allowed {
            if !tools.contains(extra) {
                tools.push(extra.clone());
            }
        }
        tools
    }
}

/// Split a list given as one string on commas, semicolons and whitespace
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AgentConfig {
    /// Defaults with environment overrides, used when no file is given
    pub fn from_env() -> Result<Self> {
        let config = Self::default().apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// merged configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file from {:?}", path))?;

        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file from {:?}", path))?;

        let config = config.apply_env_overrides();
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Load from `path` when given, from the environment otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::from_env(),
        }
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - STEADYBIT_EXTENSION_PORT
    /// - STEADYBIT_EXTENSION_HEALTH_PORT
    /// - STEADYBIT_LOG_LEVEL
    /// - STEADYBIT_LOG_FORMAT
    /// - STEADYBIT_DISCOVERY_ENV_LIST
    /// - STEADYBIT_DISCOVERY_ATTRIBUTES_EXCLUDES_HOST
    /// - STEADYBIT_DISCOVERY_INTERVAL_SECS
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = var("STEADYBIT_EXTENSION_PORT").and_then(|p| p.parse().ok()) {
            self.http.port = port;
        }
        if let Some(port) = var("STEADYBIT_EXTENSION_HEALTH_PORT").and_then(|p| p.parse().ok()) {
            self.http.health_port = port;
        }

        if let Some(level) = var("STEADYBIT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("STEADYBIT_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Some(list) = var("STEADYBIT_DISCOVERY_ENV_LIST") {
            self.discovery.env_list = split_list(&list);
        }
        if let Some(excludes) = var("STEADYBIT_DISCOVERY_ATTRIBUTES_EXCLUDES_HOST") {
            self.discovery.attribute_excludes = split_list(&excludes);
        }
        if let Some(interval) =
            var("STEADYBIT_DISCOVERY_INTERVAL_SECS").and_then(|i| i.parse().ok())
        {
            self.discovery.interval_secs = interval;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.http.port == 0 {
            anyhow::bail!("Extension port must be > 0");
        }
        if self.http.health_port == 0 {
            anyhow::bail!("Health port must be > 0");
        }
        if self.http.port == self.http.health_port {
            anyhow::bail!(
                "Extension port and health port must differ, both are {}",
                self.http.port
            );
        }

        self.logging.level()?;
        self.logging.format()?;

        if self.discovery.interval_secs < 1 {
            anyhow::bail!("Discovery interval must be at least 1 second");
        }
        if self.discovery.timeout_secs < 1 {
            anyhow::bail!("Discovery timeout must be at least 1 second");
        }
        for pattern in &self.discovery.attribute_excludes {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid attribute exclude pattern '{}'", pattern))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Serializes tests touching process environment
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.http.port, 8085);
        assert_eq!(config.http.health_port, 8081);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.discovery.interval_secs, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = AgentConfig::default().apply_overrides(overrides(&[
            ("STEADYBIT_EXTENSION_PORT", "9085"),
            ("STEADYBIT_LOG_FORMAT", "json"),
            ("STEADYBIT_DISCOVERY_ENV_LIST", "zone, rack;team  owner"),
            ("STEADYBIT_DISCOVERY_ATTRIBUTES_EXCLUDES_HOST", "host.nic,host.label.*"),
        ]));
        assert_eq!(config.http.port, 9085);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.discovery.env_list, vec!["zone", "rack", "team", "owner"]);
        assert_eq!(
            config.discovery.attribute_excludes,
            vec!["host.nic", "host.label.*"]
        );
    }

    #[test]
    fn test_unparsable_port_keeps_default() {
        let config = AgentConfig::default()
            .apply_overrides(overrides(&[("STEADYBIT_EXTENSION_PORT", "http")]));
        assert_eq!(config.http.port, 8085);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AgentConfig::default();
        config.http.health_port = config.http.port;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.http.port = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.discovery.interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.discovery.attribute_excludes = vec!["host.[".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extra_tools_extend_allow_list() {
        let mut tools = ToolsConfig::default();
        tools.extra_allowed = vec!["ethtool".to_string(), "tc".to_string()];
        let allowed = tools.allowed_tools();
        assert!(allowed.contains(&"ethtool".to_string()));
        assert_eq!(allowed.iter().filter(|t| *t == "tc").count(), 1);
    }

    #[test]
    fn test_load_valid_toml_config() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for key in [
            "STEADYBIT_EXTENSION_PORT",
            "STEADYBIT_EXTENSION_HEALTH_PORT",
            "STEADYBIT_LOG_LEVEL",
            "STEADYBIT_LOG_FORMAT",
            "STEADYBIT_DISCOVERY_ENV_LIST",
            "STEADYBIT_DISCOVERY_ATTRIBUTES_EXCLUDES_HOST",
            "STEADYBIT_DISCOVERY_INTERVAL_SECS",
        ] {
            std::env::remove_var(key);
        }

        let temp_file = NamedTempFile::new().unwrap();
        let toml_content = r#"
[http]
port = 18085
health_port = 18081

[logging]
level = "debug"
format = "json"

[discovery]
interval_secs = 60
env_list = ["zone"]
"#;
        fs::write(temp_file.path(), toml_content).unwrap();

        let config = AgentConfig::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.http.port, 18085);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.discovery.interval_secs, 60);
        assert_eq!(config.discovery.env_list, vec!["zone"]);
        assert_eq!(config.tools, ToolsConfig::default());

        std::env::set_var("STEADYBIT_EXTENSION_PORT", "28085");
        let config = AgentConfig::load_from_path(temp_file.path()).unwrap();
        std::env::remove_var("STEADYBIT_EXTENSION_PORT");
        assert_eq!(config.http.port, 28085);
    }

    #[test]
    fn test_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        fs::write(temp_file.path(), "[http\nport = ").unwrap();
        assert!(AgentConfig::load_from_path(temp_file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(AgentConfig::load_from_path(dir.path().join("agent.toml")).is_err());
    }
}
