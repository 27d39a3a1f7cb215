//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output.
//!
//! Targets used across the crate: `gateway`, `ws`, `http`, `auth`, `config`.
//!
//! Filter precedence: `CLAWGATE_LOG`, then `RUST_LOG`, then the configured
//! default level. `CLAWGATE_DEV` selects the development profile.
//!
//! ```no_run
//! use clawgate::logging::{init_logging, LogConfig, LogFormat, LogOutput};
//!
//! init_logging(LogConfig {
//!     format: LogFormat::Json,
//!     output: LogOutput::File("/var/log/clawgate.log".into()),
//!     default_level: tracing::Level::INFO,
//! }).unwrap();
//! ```

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use serde::Deserialize;
use serde_json::Value;
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_FILTER_ENV: &str = "CLAWGATE_LOG";
pub const DEV_MODE_ENV: &str = "CLAWGATE_DEV";

static INIT_GUARD: OnceLock<()> = OnceLock::new();

const TARGETS: [&str; 5] = ["gateway", "ws", "http", "auth", "config"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured logs, one JSON object per line
    Json,
    #[default]
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    /// Append to the file at this path
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Level used when neither filter variable is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

/// `logging` as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<PathBuf>,
}

impl LogConfig {
    /// Plaintext to stdout at debug level.
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout at info level.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// Pick the profile from `CLAWGATE_DEV`.
    pub fn from_env() -> Self {
        if is_truthy(std::env::var(DEV_MODE_ENV).ok().as_deref()) {
            Self::development()
        } else {
            Self::production()
        }
    }

    /// Apply the `logging` section of a loaded config value on top of this
    /// profile.
    pub fn with_config(mut self, cfg: &Value) -> Result<Self, LoggingError> {
        let Some(raw) = cfg.get("logging") else {
            return Ok(self);
        };
        let section: LoggingSection = serde_json::from_value(raw.clone())
            .map_err(|e| LoggingError::InvalidSetting(e.to_string()))?;

        if let Some(level) = section.level.as_deref() {
            self.default_level = Level::from_str(level)
                .map_err(|_| LoggingError::InvalidSetting(format!("unknown level {level:?}")))?;
        }
        match section.format.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => {}
            Some("json") => self.format = LogFormat::Json,
            Some("plaintext") | Some("text") | Some("pretty") => {
                self.format = LogFormat::Plaintext
            }
            Some(other) => {
                return Err(LoggingError::InvalidSetting(format!(
                    "unknown format {other:?}"
                )))
            }
        }
        if let Some(path) = section.file {
            self.output = LogOutput::File(path);
        }
        Ok(self)
    }
}

fn is_truthy(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to open log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("invalid logging setting: {0}")]
    InvalidSetting(String),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Filter from `CLAWGATE_LOG`, then `RUST_LOG`, then `default_level` for
/// every crate target.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    for var in [LOG_FILTER_ENV, "RUST_LOG"] {
        if let Ok(filter) = std::env::var(var) {
            return Ok(EnvFilter::try_new(filter)?);
        }
    }
    let level = default_level.as_str().to_lowercase();
    let mut directives = vec![level.clone()];
    directives.extend(TARGETS.iter().map(|target| format!("{target}={level}")));
    Ok(EnvFilter::try_new(directives.join(","))?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    })
}

fn build_layer<S>(config: &LogConfig) -> Result<Box<dyn Layer<S> + Send + Sync>, LoggingError>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let filter = build_env_filter(config.default_level)?;
    let writer = make_writer(&config.output)?;
    let ansi = !matches!(config.output, LogOutput::File(_));
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_ansi(ansi)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }
    let layer = build_layer(&config)?;
    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}

/// Plaintext debug logging for tests; ignores repeated initialization.
pub fn init_test_logging() {
    if let Ok(layer) = build_layer(&LogConfig::development()) {
        let _ = tracing_subscriber::registry().with(layer).try_init();
    }
}
