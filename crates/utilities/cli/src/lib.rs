//! Shared CLI utilities for ekko-supervisor binaries: logging, metrics, and
//! crash diagnostics wiring.

use clap::Args;
use ::tracing::Level;

pub mod backtrace;
pub mod metrics;
pub mod sigsegv_handler;
pub mod tracing;

pub use metrics::MetricsArgs;
pub use tracing::LogFormat;

/// CLI flags controlling log output, flattened into a binary's top-level [`clap::Parser`].
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// The global log level, e.g. `info`, `debug`, `warn`.
    #[arg(long = "log.level", env = "LOG_LEVEL", default_value = "info")]
    pub level: Level,

    /// Log output format for stdout.
    #[arg(long = "log.format", env = "LOG_FORMAT", default_value = "full")]
    pub format: LogFormat,

    /// Disable stdout logging entirely.
    #[arg(long = "log.no-stdout", env = "LOG_NO_STDOUT", default_value_t = false)]
    pub no_stdout: bool,

    /// Directory to write rotating log files to. Omit to disable file logging.
    #[arg(long = "log.directory", env = "LOG_DIRECTORY")]
    pub directory: Option<std::path::PathBuf>,

    /// Rotation cadence for file logs.
    #[arg(long = "log.rotation", env = "LOG_ROTATION", default_value = "daily")]
    pub rotation: LogRotation,
}

/// How often file-based logs are rotated onto a new file.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogRotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Stdout sink configuration.
#[derive(Debug, Clone)]
pub struct StdoutLogs {
    /// Output format.
    pub format: LogFormat,
}

/// Rotating file sink configuration.
#[derive(Debug, Clone)]
pub struct FileLogs {
    /// Directory the rotating files are written into.
    pub directory_path: std::path::PathBuf,
    /// Rotation cadence.
    pub rotation: LogRotation,
    /// Output format.
    pub format: LogFormat,
}

/// Resolved logging configuration, built from [`LogArgs`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Global level directive applied on top of any `RUST_LOG` filter.
    pub global_level: Level,
    /// Stdout sink, `None` if disabled.
    pub stdout_logs: Option<StdoutLogs>,
    /// File sink, `None` if no directory was configured.
    pub file_logs: Option<FileLogs>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            global_level: Level::INFO,
            stdout_logs: Some(StdoutLogs { format: LogFormat::Full }),
            file_logs: None,
        }
    }
}

impl LogConfig {
    /// Builds a [`LogConfig`] from parsed [`LogArgs`].
    pub fn new(args: LogArgs) -> Self {
        Self {
            global_level: args.level,
            stdout_logs: (!args.no_stdout).then_some(StdoutLogs { format: args.format }),
            file_logs: args.directory.map(|directory_path| FileLogs {
                directory_path,
                rotation: args.rotation,
                format: args.format,
            }),
        }
    }
}

/// Returns the CLAP styling used by every ekko-supervisor binary.
pub fn cli_styles() -> clap::builder::Styles {
    clap::builder::Styles::styled()
        .header(anstyle::AnsiColor::Yellow.on_default())
        .usage(anstyle::AnsiColor::Yellow.on_default())
        .literal(anstyle::AnsiColor::Green.on_default())
        .placeholder(anstyle::AnsiColor::Green.on_default())
}
