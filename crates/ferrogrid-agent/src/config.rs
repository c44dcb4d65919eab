//! Agent configuration

use crate::error::ConfigError;
use ferrogrid_proto::Interest;
use ferrogrid_wasm::WasmConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the file cache directory under the working directory
pub const FILE_MANAGER_DIR: &str = "filemanager";

/// Agent configuration, usually loaded from a YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConf {
    /// Controller address as `host:port`
    pub grid_host: String,
    /// Working directory; the file cache lives below it
    pub working_dir: PathBuf,
    /// Period between two token registrations, which double as keepalive
    pub registration_period_ms: u64,
    /// Timeout for file downloads from the grid
    pub grid_read_timeout_ms: u64,
    /// Free tokens idle for longer than this lose their session
    pub token_session_idle_timeout_ms: u64,
    /// Period of the idle session sweep
    pub session_eviction_period_ms: u64,
    /// Agent-wide properties visible to every handler
    pub properties: HashMap<String, String>,
    /// Token groups hosted by this agent
    pub token_groups: Vec<TokenGroupConf>,
    /// WASM handler limits
    pub wasm: WasmConf,
}

impl Default for AgentConf {
    fn default() -> Self {
        Self {
            grid_host: "127.0.0.1:8081".to_string(),
            working_dir: PathBuf::from("."),
            registration_period_ms: 10_000,
            grid_read_timeout_ms: 20_000,
            token_session_idle_timeout_ms: 300_000,
            session_eviction_period_ms: 10_000,
            properties: HashMap::new(),
            token_groups: Vec::new(),
            wasm: WasmConf::default(),
        }
    }
}

/// A number of identical tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenGroupConf {
    /// Number of tokens in the group
    pub capacity: u32,
    /// Configuration shared by the group's tokens
    pub token_conf: TokenConf,
}

/// Configuration of one token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConf {
    /// Capability attributes advertised to the grid
    pub attributes: HashMap<String, String>,
    /// Interests the token places on requesters
    pub selection_patterns: HashMap<String, Interest>,
    /// Properties visible to handlers running on the token
    pub properties: HashMap<String, String>,
}

impl TokenConf {
    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a selection pattern
    pub fn with_selection_pattern(mut self, key: impl Into<String>, interest: Interest) -> Self {
        self.selection_patterns.insert(key.into(), interest);
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Limits applied to WASM handlers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasmConf {
    /// Fuel granted to each invocation; `None` disables fuel metering
    pub max_fuel: Option<u64>,
    /// Wall-clock limit of one invocation
    pub max_execution_time_ms: u64,
    /// Maximum linear memory per instance
    pub max_memory_bytes: usize,
    /// Link WASI for modules importing it
    pub enable_wasi: bool,
}

impl Default for WasmConf {
    fn default() -> Self {
        let defaults = WasmConfig::default();
        Self {
            max_fuel: defaults.max_fuel,
            max_execution_time_ms: defaults.max_execution_time.as_millis() as u64,
            max_memory_bytes: defaults.max_memory,
            enable_wasi: defaults.enable_wasi,
        }
    }
}

impl From<&WasmConf> for WasmConfig {
    fn from(conf: &WasmConf) -> Self {
        WasmConfig {
            max_memory: conf.max_memory_bytes,
            max_execution_time: Duration::from_millis(conf.max_execution_time_ms),
            max_fuel: conf.max_fuel,
            enable_wasi: conf.enable_wasi,
        }
    }
}

impl AgentConf {
    /// Load and validate a YAML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let conf: Self = serde_yaml::from_str(text)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_host.trim().is_empty() {
            return Err(ConfigError::Invalid("grid_host must not be empty".to_string()));
        }
        if self.registration_period_ms == 0 || self.session_eviction_period_ms == 0 {
            return Err(ConfigError::Invalid("periods must be greater than zero".to_string()));
        }
        for group in &self.token_groups {
            for (key, interest) in &group.token_conf.selection_patterns {
                Interest::new(interest.selection_pattern.clone(), interest.must_match).map_err(|e| {
                    ConfigError::Invalid(format!("selection pattern for '{}': {}", key, e))
                })?;
            }
        }
        Ok(())
    }

    /// Set the controller address
    pub fn with_grid_host(mut self, grid_host: impl Into<String>) -> Self {
        self.grid_host = grid_host.into();
        self
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    /// Add a token group
    pub fn with_token_group(mut self, capacity: u32, token_conf: TokenConf) -> Self {
        self.token_groups.push(TokenGroupConf { capacity, token_conf });
        self
    }

    /// Add an agent property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Directory of the file cache
    pub fn file_manager_dir(&self) -> PathBuf {
        self.working_dir.join(FILE_MANAGER_DIR)
    }

    /// Registration period
    pub fn registration_period(&self) -> Duration {
        Duration::from_millis(self.registration_period_ms)
    }

    /// File download timeout
    pub fn grid_read_timeout(&self) -> Duration {
        Duration::from_millis(self.grid_read_timeout_ms)
    }

    /// Idle threshold of token sessions
    pub fn token_session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.token_session_idle_timeout_ms)
    }

    /// Period of the idle session sweep
    pub fn session_eviction_period(&self) -> Duration {
        Duration::from_millis(self.session_eviction_period_ms)
    }
}
