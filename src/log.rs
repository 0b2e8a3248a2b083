//! Logging setup for the daemon.
//!
//! Adapted from the teacher's `tracing`/`tracing-subscriber` setup
//! (`cascade::log`), trimmed to the targets this daemon actually needs:
//! stdout, stderr, or a file, selected by the `-l/--logfile` CLI flag,
//! with verbosity controlled by `-v/--verbosity` (spec.md §6). Unlike
//! `cascade`, nothing here reloads the filter at runtime: there is no
//! SIGHUP handler or reload CLI path, so the level is fixed at launch.
//!
//! The original Python implementation (`utils.py`) names two loggers,
//! `MAIN` and `STS`; we keep that split as two `tracing` targets rather
//! than two separate subscribers, since a single `EnvFilter` covers both.

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logging verbosity, mirroring the original's `LogLevel` IntEnum
/// (`utils.py`) and exposed on the CLI as `-v/--verbosity`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Crit,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
            LogLevel::Crit => "crit",
        };
        f.write_str(s)
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal | LogLevel::Crit => LevelFilter::ERROR,
        }
    }
}

/// Marker returned by [`Logger::launch`] once the global subscriber is
/// installed. Carries no state; kept as a type so call sites look the
/// same whether or not a future version grows reload capability.
#[derive(Debug)]
pub struct Logger;

impl Logger {
    /// Launch the global logger. Must be called at most once per process.
    pub fn launch(level: LogLevel, logfile: Option<&Path>) -> Result<&'static Logger, String> {
        let filter = EnvFilter::default().add_directive(LevelFilter::from(level).into());

        match logfile {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|err| format!("cannot open {}: {err}", path.display()))?;
                let layer = FmtLayer::new().with_ansi(false).with_writer(file);
                tracing_subscriber::registry().with(filter).with(layer).init();
            }
            None => {
                let layer = FmtLayer::new()
                    .with_ansi(supports_color::on(supports_color::Stream::Stderr).is_some())
                    .with_writer(std::io::stderr);
                tracing_subscriber::registry().with(filter).with(layer).init();
            }
        }

        Ok(Box::leak(Box::new(Self)))
    }
}
