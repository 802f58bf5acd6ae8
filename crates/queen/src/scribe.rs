//! Log output setup.
//!
//! Logs go to stdout by default, or to a daily-rolling file when a log
//! directory is configured.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;

/// How much to say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    /// Print everything.
    Debug,
    /// Progress and errors.
    Normal,
    /// Errors only.
    Error,
    /// Print nothing.
    None,
}

impl LogLevel {
    fn filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Normal => LevelFilter::INFO,
            Self::Error => LevelFilter::ERROR,
            Self::None => LevelFilter::OFF,
        }
    }
}

/// Keeps the background log writer alive; drop it last.
#[derive(Debug)]
pub struct LogGuard(Option<WorkerGuard>);

/// Install the global subscriber.
pub fn init(level: LogLevel, directory: Option<&Path>) -> LogGuard {
    match directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "hlhv-queen.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_max_level(level.filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            LogGuard(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_max_level(level.filter())
                .init();
            LogGuard(None)
        }
    }
}
