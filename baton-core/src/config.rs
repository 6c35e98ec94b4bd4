//! Configuration model for the orchestration core
//!
//! # Examples
//!
//! ```rust
//! use baton_core::config::OrchestratorConfig;
//!
//! let config = OrchestratorConfig::builder()
//!     .heartbeat_window_seconds(30)
//!     .spawn_timeout_seconds(60)
//!     .workspace_root("/tmp/baton-workspaces")
//!     .max_agents(16)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.default_base_ref, "main");
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime settings for the orchestration core
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Seconds without a heartbeat before a session is marked stale
    pub heartbeat_window_seconds: u64,
    /// Interval between heartbeat sweep passes
    pub sweep_interval_seconds: u64,
    /// Seconds a spawning agent may wait for its session handshake
    pub spawn_timeout_seconds: u64,
    /// Directory under which isolated workspaces are provisioned
    pub workspace_root: PathBuf,
    /// Base reference workspaces derive from when none is given
    pub default_base_ref: String,
    /// Capacity of the observer event channel
    pub event_capacity: usize,
    /// Upper bound on the live agent set
    pub max_agents: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_window_seconds: 30,
            sweep_interval_seconds: 10,
            spawn_timeout_seconds: 60,
            workspace_root: PathBuf::from(".baton/workspaces"),
            default_base_ref: "main".to_string(),
            event_capacity: 512,
            max_agents: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Create a builder for constructing a configuration
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Heartbeat staleness window as a chrono duration
    pub fn heartbeat_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_window_seconds as i64)
    }

    /// Sweep interval as a std duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Spawn timeout as a std duration
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_seconds)
    }

    /// Validate the configuration values
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_window_seconds == 0 {
            return Err(Error::configuration("Heartbeat window must be positive"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(Error::configuration("Sweep interval must be positive"));
        }
        if self.sweep_interval_seconds > self.heartbeat_window_seconds {
            return Err(Error::configuration(
                "Sweep interval cannot exceed the heartbeat window",
            ));
        }
        if self.spawn_timeout_seconds == 0 {
            return Err(Error::configuration("Spawn timeout must be positive"));
        }
        if self.workspace_root.as_os_str().is_empty() {
            return Err(Error::configuration("Workspace root cannot be empty"));
        }
        if self.default_base_ref.trim().is_empty() {
            return Err(Error::configuration("Default base ref cannot be empty"));
        }
        if self.event_capacity == 0 {
            return Err(Error::configuration("Event capacity must be positive"));
        }
        if self.max_agents == 0 {
            return Err(Error::configuration("Agent cap must be positive"));
        }
        Ok(())
    }
}

/// Builder for [`OrchestratorConfig`]
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: Option<OrchestratorConfig>,
}

impl OrchestratorConfigBuilder {
    fn config_mut(&mut self) -> &mut OrchestratorConfig {
        self.config.get_or_insert_with(OrchestratorConfig::default)
    }

    /// Set the heartbeat staleness window in seconds
    pub fn heartbeat_window_seconds(mut self, seconds: u64) -> Self {
        self.config_mut().heartbeat_window_seconds = seconds;
        self
    }

    /// Set the sweep interval in seconds
    pub fn sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.config_mut().sweep_interval_seconds = seconds;
        self
    }

    /// Set the spawn timeout in seconds
    pub fn spawn_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config_mut().spawn_timeout_seconds = seconds;
        self
    }

    /// Set the workspace root directory
    pub fn workspace_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.config_mut().workspace_root = root.into();
        self
    }

    /// Set the default base reference
    pub fn default_base_ref<S: Into<String>>(mut self, base_ref: S) -> Self {
        self.config_mut().default_base_ref = base_ref.into();
        self
    }

    /// Set the observer event channel capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config_mut().event_capacity = capacity;
        self
    }

    /// Set the live agent cap
    pub fn max_agents(mut self, max_agents: u32) -> Self {
        self.config_mut().max_agents = max_agents;
        self
    }

    /// Build the configuration, validating all values
    pub fn build(self) -> Result<OrchestratorConfig> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }
}
