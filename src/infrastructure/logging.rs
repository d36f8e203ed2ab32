//! Logging system configuration and initialization
//!
//! This module provides the logging setup with:
//! - Console and file output support
//! - File logging with time based rotation
//! - Structured JSON logging (optional)
//! - Log level control from the configuration file, overridable by `RUST_LOG`
//! - Log files stored relative to executable location unless configured

#![allow(clippy::uninlined_format_args)]

use anyhow::{anyhow, Result};
use chrono::Utc;
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{
    fmt::{self, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

// Logging settings live with the rest of the configuration
pub use crate::infrastructure::config::LoggingConfig;

// Dropping a guard stops its file writer
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// UTC timestamps with millisecond precision
struct UtcTimeFormatter;

impl FormatTime for UtcTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

/// Get the log directory relative to the executable location
pub fn get_log_directory() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Build the filter: `RUST_LOG` wins, otherwise the configured level with
/// chatty dependencies quieted unless TRACE was asked for.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)?;
    if !config.level.to_lowercase().contains("trace") {
        for directive in [
            "sqlx::query=warn",
            "sqlx::sqlite=warn",
            "reqwest=info",
            "hyper=warn",
            "hyper_util=warn",
            "h2=warn",
            "tokio=info",
        ] {
            filter = filter.add_directive(directive.parse()?);
        }
        filter = filter.add_directive(format!("market_store={}", config.level).parse()?);
    }
    Ok(filter)
}

fn file_appender(log_dir: &Path, config: &LoggingConfig) -> Result<RollingFileAppender> {
    let appender = match config.rotation.as_str() {
        "never" => rolling::never(log_dir, &config.file_name),
        "daily" => rolling::daily(log_dir, &config.file_name),
        "hourly" => rolling::hourly(log_dir, &config.file_name),
        other => return Err(anyhow!("Unknown log rotation {:?}", other)),
    };
    Ok(appender)
}

/// Background file writer; its guard lives until process exit
fn file_writer(log_dir: &Path, config: &LoggingConfig) -> Result<NonBlocking> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender(log_dir, config)?);
    LOG_GUARDS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(guard);
    Ok(writer)
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// ```bash
/// # Show all SQL queries
/// RUST_LOG="debug,sqlx::query=debug" market-store
///
/// # Show detailed HTTP logs
/// RUST_LOG="debug,reqwest=debug,hyper=debug" market-store
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if !config.file_output && !config.console_output {
        return Err(anyhow!("No logging output configured"));
    }

    let log_dir = config.log_dir.clone().unwrap_or_else(get_log_directory);
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.file_output {
        let writer = file_writer(&log_dir, config)?;
        let file_layer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_timer(UtcTimeFormatter)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::Layer::new()
                .with_writer(writer)
                .with_timer(UtcTimeFormatter)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stdout)
                .with_timer(UtcTimeFormatter)
                .with_target(false)
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .with(build_env_filter(config)?)
        .try_init()
        .map_err(|e| anyhow!("Failed to install global subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log directory: {:?} (rotation: {})", log_dir, config.rotation);
    }
    Ok(())
}

/// Log system information for diagnostics
pub fn log_system_info() {
    info!("=== Market Store System Information ===");
    info!("Application version: {}", env!("CARGO_PKG_VERSION"));
    info!("Operating system: {}", std::env::consts::OS);
    info!("Architecture: {}", std::env::consts::ARCH);
    info!("========================================");
}
