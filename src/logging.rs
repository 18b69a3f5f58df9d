//! Tracing subscriber setup for the `port-discovery` binary.
//!
//! Library crates only emit events. This module installs the global
//! subscriber that decides where they go:
//! - `RUST_LOG` takes precedence over `application.log_level`
//! - `application.log_format` (or `--log-format`) selects compact, pretty or
//!   JSON lines
//! - output goes to stderr so stdout stays free for command results
//!
//! Worker stderr lines arrive under the `discovery_worker` target.
//!
//! # Example
//! ```no_run
//! use port_discovery::{config::AppConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//! info!("discovery started");
//! # Ok(())
//! # }
//! ```

use crate::config::AppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// One short line per event
    #[default]
    Compact,
    /// Multi-line, human oriented
    Pretty,
    /// One JSON object per event
    Json,
}

impl OutputFormat {
    /// Name used in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Compact => "compact",
            OutputFormat::Pretty => "pretty",
            OutputFormat::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(OutputFormat::Compact),
            "pretty" => Ok(OutputFormat::Pretty),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!(
                "invalid log format '{}', must be one of: compact, pretty, json",
                s
            )),
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    /// Level used when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: OutputFormat,
    /// Colors for the compact and pretty layouts
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_ansi: false,
        }
    }
}

impl TracingConfig {
    /// Options from the `[application]` section.
    pub fn from_app_config(config: &AppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Override the line layout.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }
}

/// Install the subscriber described by `config.application`.
pub fn init_from_config(config: &AppConfig) -> Result<(), String> {
    init(TracingConfig::from_app_config(config)?)
}

/// Install the global subscriber.
///
/// Calling this again once a subscriber is installed returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    let layer = fmt::layer().with_writer(std::io::stderr);
    let layer = match config.format {
        OutputFormat::Compact => layer.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Pretty => layer.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => layer.json().with_ansi(false).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(layer.with_filter(config.filter()))
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("failed to initialize tracing: {}", e)),
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!(
            "invalid log level '{}', must be one of: trace, debug, info, warn, error",
            level
        )
    })
}
