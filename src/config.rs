//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/discovery.toml` (or the file given on the command line)
//! 3. Environment variables prefixed with `PORT_DISCOVERY_`, using `__` to
//!    separate sections (`PORT_DISCOVERY_DISCOVERY__QUIT_GRACE_PERIOD=2s`)
//!
//! # Example
//! ```no_run
//! use port_discovery::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! config.validate()?;
//! let manager = config.build_manager()?;
//! println!("{} discoveries configured", manager.len());
//! # Ok(())
//! # }
//! ```

use discovery_manager::{
    DiscoveryManager, DriverSettings, ManagerSettings, PluggableDiscovery, ProcessLauncher,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use crate::logging::OutputFormat;
use thiserror::Error;
use tracing::debug;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/discovery.toml";

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "PORT_DISCOVERY_";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A source could not be read or did not match the schema.
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    /// Values parse but make no sense together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Driver and manager tunables
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Discovery workers to register
    #[serde(default)]
    pub workers: Vec<WorkerDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line layout (compact, pretty, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: default_log_format(),
        }
    }
}

/// Discovery tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Capacity of each worker's event stream
    #[serde(default = "default_buffer_size")]
    pub event_buffer_size: usize,
    /// Capacity of the merged event stream
    #[serde(default = "default_buffer_size")]
    pub global_buffer_size: usize,
    /// Time a worker gets to acknowledge `QUIT` and exit
    #[serde(default = "default_quit_grace_period", with = "humantime_serde")]
    pub quit_grace_period: Duration,
    /// Upper bound for other command round trips
    #[serde(default, with = "humantime_serde")]
    pub response_timeout: Option<Duration>,
    /// Sent to workers in the handshake
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_buffer_size(),
            global_buffer_size: default_buffer_size(),
            quit_grace_period: default_quit_grace_period(),
            response_timeout: None,
            user_agent: default_user_agent(),
        }
    }
}

/// One discovery worker executable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDefinition {
    /// Unique discovery identifier (e.g. `builtin:serial-discovery`)
    pub id: String,
    /// Path of the worker executable
    pub command: PathBuf,
    /// Arguments passed to the worker
    #[serde(default)]
    pub args: Vec<String>,
    /// Whether this worker is registered
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_log_format() -> String {
    OutputFormat::default().as_str().to_string()
}

fn default_buffer_size() -> usize {
    5
}

fn default_quit_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_user_agent() -> String {
    format!("port-discovery {}", env!("CARGO_PKG_VERSION"))
}

fn default_enabled() -> bool {
    true
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment. A missing file leaves
    /// the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        self.application
            .log_format
            .parse::<OutputFormat>()
            .map_err(ConfigError::Invalid)?;

        if self.discovery.event_buffer_size == 0 || self.discovery.global_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer_size and global_buffer_size must be at least 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                return Err(ConfigError::Invalid("worker id must not be empty".to_string()));
            }
            if !ids.insert(worker.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate worker id: {}",
                    worker.id
                )));
            }
            if worker.command.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "worker {} has no command",
                    worker.id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled workers
    pub fn enabled_workers(&self) -> impl Iterator<Item = &WorkerDefinition> {
        self.workers.iter().filter(|worker| worker.enabled)
    }

    /// Settings applied to every driver.
    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings::default()
            .with_user_agent(self.discovery.user_agent.clone())
            .with_quit_grace_period(self.discovery.quit_grace_period)
            .with_response_timeout(self.discovery.response_timeout)
    }

    /// Channel sizes of the manager.
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            event_buffer_size: self.discovery.event_buffer_size,
            global_buffer_size: self.discovery.global_buffer_size,
        }
    }

    /// Validate and register every enabled worker with a process launcher.
    pub fn build_manager(&self) -> Result<DiscoveryManager, ConfigError> {
        self.validate()?;

        let manager = DiscoveryManager::with_settings(self.manager_settings());
        for worker in self.enabled_workers() {
            let launcher = ProcessLauncher::new(worker.id.clone(), worker.command.clone())
                .with_args(worker.args.iter().cloned());
            debug!(
                discovery = %worker.id,
                program = %launcher.program().display(),
                args = ?launcher.args(),
                "configured discovery worker"
            );
            let discovery = PluggableDiscovery::with_settings(
                worker.id.clone(),
                Arc::new(launcher),
                self.driver_settings(),
            );
            manager
                .add(discovery)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, command: &str) -> WorkerDefinition {
        WorkerDefinition {
            id: id.to_string(),
            command: PathBuf::from(command),
            args: vec![],
            enabled: true,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.event_buffer_size, 5);
        assert_eq!(config.discovery.quit_grace_period, Duration::from_secs(5));
        assert_eq!(config.discovery.response_timeout, None);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = AppConfig::default();
        config.application.log_format = "xml".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invalid log format 'xml'"));

        config.application.log_format = "Pretty".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let mut config = AppConfig::default();
        config.discovery.global_buffer_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_worker_ids() {
        let config = AppConfig {
            workers: vec![
                worker("builtin:serial-discovery", "/opt/serial-discovery"),
                worker("builtin:serial-discovery", "/opt/other"),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate worker id"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let config = AppConfig {
            workers: vec![worker("builtin:mdns-discovery", "")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_manager_skips_disabled_workers() {
        let mut disabled = worker("teensy", "/opt/teensy-discovery");
        disabled.enabled = false;
        let config = AppConfig {
            workers: vec![worker("serial", "/opt/serial-discovery"), disabled],
            ..Default::default()
        };

        let manager = config.build_manager().unwrap();
        assert_eq!(manager.ids(), vec!["serial"]);
        assert_eq!(manager.settings(), config.manager_settings());
    }
}
