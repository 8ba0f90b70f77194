use std::fs;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::infrastructure::config::{env_flag, env_or};

/// Configuration for console and file logging
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub enable_console: bool,
    pub enable_file: bool,
    pub log_level: Level,
    pub enable_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".to_string(),
            enable_console: true,
            enable_file: true,
            log_level: Level::INFO,
            enable_json: false,
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_dir: env_or("LOG_DIR", defaults.log_dir),
            enable_json: env_flag("LOG_JSON", defaults.enable_json),
            enable_file: env_flag("LOG_TO_FILE", defaults.enable_file),
            ..defaults
        }
    }

    fn default_filter(&self) -> String {
        format!(
            "core_ledger_outbox={level},ledger_worker={level},sqlx=warn,rdkafka=warn,tower_http=info",
            level = self.log_level
        )
    }
}

/// Installs the global subscriber. The returned guards flush the file
/// writers when dropped and must be held for the life of the process.
pub fn init_logging(config: LoggingConfig) -> Result<Vec<WorkerGuard>, Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let mut layers: Vec<Box<dyn Layer<_> + Send + Sync>> = Vec::new();
    let mut guards = Vec::new();

    if config.enable_console {
        if config.enable_json {
            layers.push(Box::new(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ));
        } else {
            layers.push(Box::new(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true),
            ));
        }
    }

    if config.enable_file {
        fs::create_dir_all(&config.log_dir)?;

        let all_appender =
            RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "ledger-worker.log");
        let (all_writer, all_guard) = tracing_appender::non_blocking(all_appender);
        guards.push(all_guard);

        let error_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "error.log");
        let (error_writer, error_guard) = tracing_appender::non_blocking(error_appender);
        guards.push(error_guard);

        layers.push(Box::new(
            fmt::layer()
                .with_writer(all_writer)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false),
        ));

        layers.push(Box::new(
            fmt::layer()
                .with_writer(error_writer)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_filter(tracing_subscriber::filter::LevelFilter::WARN),
        ));
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    Ok(guards)
}
