//! Console and file log sinks for the training-set builder.
//!
//! The console follows `FPL_LOG_LEVEL` for this crate and keeps dependencies at
//! `warn`. The optional file sink always records this crate at `debug` so a failed
//! run can be inspected afterwards.

use std::env;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{non_empty, parse_switch, PipelineConfig};

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const LOG_FILE_PREFIX: &str = "fpl_features";
const LOG_FILE_SUFFIX: &str = "log";
const MAX_LOG_FILES: usize = 5;

/// Targets that follow the configured level; everything else stays at `warn`.
const CRATE_TARGETS: [&str; 2] = ["fpl_features", "build_training_set"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
    /// Daily-rotated debug log directory; `None` disables the file sink.
    pub log_dir: Option<PathBuf>,
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_target: true,
            log_dir: Some(PathBuf::from(DEFAULT_LOG_DIR)),
            file_level: "debug".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("log file sink could not be created: {0}")]
    FileSink(#[from] InitError),
    #[error("global subscriber already installed: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let var = |key: &str| non_empty(lookup(key));
    let mut config = LoggingConfig::default();

    if let Some(level) = var("FPL_LOG_LEVEL") {
        config.level = level.to_ascii_lowercase();
    }
    if let Some(format) = var("FPL_LOG_FORMAT").and_then(|raw| parse_log_format(&raw)) {
        config.format = format;
    }
    if let Some(include_target) = var("FPL_LOG_TARGET").and_then(|raw| parse_switch(&raw)) {
        config.include_target = include_target;
    }
    if let Some(dir) = var("FPL_LOG_DIR") {
        config.log_dir = match parse_switch(&dir) {
            Some(false) => None,
            _ => Some(PathBuf::from(dir)),
        };
    }
    if let Some(level) = var("FPL_LOG_FILE_LEVEL") {
        config.file_level = level.to_ascii_lowercase();
    }

    config
}

/// Filter directives for a sink. A level that already carries directives
/// (`fpl_features::ingest=trace,warn`) is used verbatim.
pub fn filter_directives(level: &str) -> String {
    if level.contains('=') || level.contains(',') {
        return level.to_string();
    }
    let mut directives = vec!["warn".to_string()];
    directives.extend(CRATE_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

fn sink_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(filter_directives(level))
        .unwrap_or_else(|_| EnvFilter::new(filter_directives("info")))
}

/// Installs the global subscriber. Keep the returned guard alive for the whole run;
/// dropping it flushes the file sink.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingInitError> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let console = fmt::layer().with_target(config.include_target);
    let console = match config.format {
        LogFormat::Json => console.json().with_filter(sink_filter(&config.level)).boxed(),
        LogFormat::Pretty => console.pretty().with_filter(sink_filter(&config.level)).boxed(),
        LogFormat::Compact => console.compact().with_filter(sink_filter(&config.level)).boxed(),
    };
    layers.push(console);

    let guard = match &config.log_dir {
        Some(dir) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(MAX_LOG_FILES)
                .build(dir)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer)
                    .with_filter(sink_filter(&config.file_level))
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry().with(layers).try_init()?;
    Ok(guard)
}

pub fn log_app_start(logging: &LoggingConfig, pipeline: &PipelineConfig) {
    info!(
        component = "build_training_set",
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        log_dir = ?logging.log_dir,
        base_url = %pipeline.ingest.base_url,
        timeout_ms = pipeline.ingest.timeout_ms,
        max_concurrency = ?pipeline.ingest.max_concurrency,
        windows = ?pipeline.features.rolling_windows,
        output_dir = %pipeline.output_dir.display(),
        output_name = %pipeline.output_name
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}
