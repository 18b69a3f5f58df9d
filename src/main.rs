//! CLI Entry Point for port-discovery
//!
//! Provides command-line access to the configured discovery workers:
//! - Listing the ports currently attached
//! - Watching add/remove events as they happen
//! - Resolving a single address to a fully described port
//!
//! # Usage
//!
//! ```bash
//! port-discovery list
//! port-discovery --format json watch --duration 30s
//! port-discovery --log-format json list
//! port-discovery resolve --port /dev/ttyACM0
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use discovery_manager::{DiscoveryManager, Event, ManagerError, Port};
use humantime_serde::re::humantime;
use port_discovery::config::{AppConfig, DEFAULT_CONFIG_PATH};
use port_discovery::logging::{self, OutputFormat, TracingConfig};
use port_discovery::port_resolver::{quit_draining, resolve_port, PortQuery};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "port-discovery")]
#[command(about = "Run pluggable discovery workers and report the ports they find", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output format for results on stdout
    #[arg(long, global = true, value_enum, default_value_t = Format::Text)]
    format: Format,

    /// Log line layout on stderr, overriding `application.log_format`
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// List the ports reported by every discovery
    List,

    /// Print port events until interrupted
    Watch {
        /// Stop after this long (e.g. "30s", "2m")
        #[arg(long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Resolve an address to a port
    Resolve {
        /// Port address, empty for the default sentinel
        #[arg(long, default_value = "")]
        port: String,

        /// Required protocol of the port
        #[arg(long)]
        protocol: Option<String>,

        /// How long to wait for a discovery to report the port
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5s")]
        discovery_timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    let mut tracing_config = TracingConfig::from_app_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_ansi(std::io::stderr().is_terminal());
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    let manager = config.build_manager()?;
    if manager.is_empty() {
        warn!(config = %cli.config.display(), "no discovery workers configured");
    }

    match cli.command {
        Commands::List => list_ports(&manager, cli.format).await,
        Commands::Watch { duration } => watch_events(&manager, cli.format, duration).await,
        Commands::Resolve {
            port,
            protocol,
            discovery_timeout,
        } => {
            let mut query = PortQuery::new(port).with_timeout(discovery_timeout);
            if let Some(protocol) = protocol {
                query = query.with_protocol(protocol);
            }
            let port = resolve_port(&manager, &query).await?;
            print_port(&port, cli.format)
        }
    }
}

async fn list_ports(manager: &DiscoveryManager, format: Format) -> Result<()> {
    report_errors(manager.run_all().await);
    report_errors(manager.start_all().await);

    let (ports, errors) = manager.list().await;
    report_errors(errors);
    report_errors(manager.quit_all().await);

    for port in &ports {
        print_port(port, format)?;
    }
    info!(count = ports.len(), "listed ports");
    Ok(())
}

async fn watch_events(
    manager: &DiscoveryManager,
    format: Format,
    duration: Option<Duration>,
) -> Result<()> {
    report_errors(manager.run_all().await);
    let (events, errors) = manager.start_sync_all().await;
    report_errors(errors);

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(deadline, interrupted);

    let watched = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = print_event(&event, format) {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = &mut deadline => break Ok(()),
            signal = &mut interrupted => {
                break signal.context("waiting for ctrl-c");
            }
        }
    };

    report_errors(quit_draining(manager, &events).await);
    watched
}

fn report_errors(errors: Vec<ManagerError>) {
    for e in errors {
        eprintln!("warning: {}", e);
    }
}

fn print_port(port: &Port, format: Format) -> Result<()> {
    match format {
        Format::Text if port.label.is_empty() => println!("{}\t{}", port.address, port.protocol),
        Format::Text => println!("{}\t{}\t{}", port.address, port.protocol, port.label),
        Format::Json => println!("{}", serde_json::to_string(port)?),
    }
    Ok(())
}

fn print_event(event: &Event, format: Format) -> Result<()> {
    match format {
        Format::Text => println!("{}\t{}\t{}", event.kind, event.port.address, event.port.protocol),
        Format::Json => println!("{}", serde_json::to_string(event)?),
    }
    Ok(())
}
