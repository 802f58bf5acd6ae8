//! Command line options.

use std::path::PathBuf;

use clap::Parser;

use crate::scribe::LogLevel;

/// HLHV queen cell server.
#[derive(Debug, Parser)]
#[command(name = "hlhv-queen", version, about = "HLHV queen cell server")]
pub struct Options {
    /// The amount of logs to produce. Debug prints everything, and none
    /// prints nothing.
    #[arg(short = 'l', long = "log-level", value_enum, default_value_t = LogLevel::Normal)]
    pub log_level: LogLevel,

    /// The directory in which to store log files. If unspecified, logs
    /// will be written to stdout.
    #[arg(short = 'L', long = "log-directory")]
    pub log_directory: Option<PathBuf>,

    /// Path to the config file.
    #[arg(long = "conf-path", default_value = "/etc/hlhv/hlhv.conf")]
    pub conf_path: PathBuf,
}
