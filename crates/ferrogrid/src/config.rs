//! Grid configuration

use crate::error::GridError;
use crate::selector::SelectionTimeouts;
use ferrogrid_proto::InputMessage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller configuration, loadable from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConf {
    /// Address agents connect to
    pub bind: String,
    /// Tokens of agents that stop re-registering for this long are invalidated
    pub token_keepalive_timeout_ms: u64,
    /// Period of the keepalive check
    pub keepalive_check_period_ms: u64,
    /// Default handler call timeout
    pub call_timeout_ms: u64,
    /// Timeout of the reserve and release requests sent to agents
    pub token_reservation_timeout_ms: u64,
    /// Base directory for relative paths given to the file manager
    pub file_manager_dir: PathBuf,
    /// How long a token request waits when matching tokens are all reserved
    pub match_exists_timeout_ms: u64,
    /// How long a token request waits when no registered token matches
    pub no_match_exists_timeout_ms: u64,
    /// Working directory of the in-process agent running local tokens.
    /// Defaults to a directory under the system temp dir.
    pub local_agent_dir: Option<PathBuf>,
}

impl Default for GridConf {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8081".to_string(),
            token_keepalive_timeout_ms: 60_000,
            keepalive_check_period_ms: 10_000,
            call_timeout_ms: InputMessage::DEFAULT_CALL_TIMEOUT_MS,
            token_reservation_timeout_ms: 10_000,
            file_manager_dir: PathBuf::from("."),
            match_exists_timeout_ms: 60_000,
            no_match_exists_timeout_ms: 10_000,
            local_agent_dir: None,
        }
    }
}

impl GridConf {
    /// Load a YAML configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GridError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(text: &str) -> Result<Self, GridError> {
        let conf: Self = serde_yaml::from_str(text).map_err(|e| GridError::Config(e.to_string()))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Check values serde cannot check
    pub fn validate(&self) -> Result<(), GridError> {
        if self.bind.trim().is_empty() {
            return Err(GridError::Config("bind must not be empty".to_string()));
        }
        if self.keepalive_check_period_ms == 0 {
            return Err(GridError::Config("keepalive_check_period_ms must be greater than zero".to_string()));
        }
        Ok(())
    }

    /// Set the bind address
    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    /// Set the token keepalive timeout
    pub fn with_token_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.token_keepalive_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the keepalive check period
    pub fn with_keepalive_check_period(mut self, period: Duration) -> Self {
        self.keepalive_check_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the default call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the file manager base directory
    pub fn with_file_manager_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_manager_dir = dir.into();
        self
    }

    /// Set the working directory of the local agent
    pub fn with_local_agent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_agent_dir = Some(dir.into());
        self
    }

    /// Set both token selection waits
    pub fn with_selection_timeouts(mut self, timeouts: SelectionTimeouts) -> Self {
        self.match_exists_timeout_ms = timeouts.match_exists.as_millis() as u64;
        self.no_match_exists_timeout_ms = timeouts.no_match_exists.as_millis() as u64;
        self
    }

    /// Token keepalive timeout
    pub fn token_keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.token_keepalive_timeout_ms)
    }

    /// Keepalive check period
    pub fn keepalive_check_period(&self) -> Duration {
        Duration::from_millis(self.keepalive_check_period_ms)
    }

    /// Default call timeout
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Reserve and release timeout
    pub fn token_reservation_timeout(&self) -> Duration {
        Duration::from_millis(self.token_reservation_timeout_ms)
    }

    /// Default waits of a token request
    pub fn selection_timeouts(&self) -> SelectionTimeouts {
        SelectionTimeouts::new(
            Duration::from_millis(self.match_exists_timeout_ms),
            Duration::from_millis(self.no_match_exists_timeout_ms),
        )
    }
}
