use crate::log::Level;
use clap::{Parser, crate_version};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TraceFormat {
    /// A verbose structured log format (default).
    #[default]
    Full,
    /// A JSON log format used for machine consumption.
    Json,
    /// A pretty human-readable log format used for debugging.
    Pretty,
}

/// Settings given on the command line. Unset options fall back to the config
/// file, then to built-in defaults.
#[derive(Clone, Debug, Parser)]
#[command(
    name = "webterm",
    version,
    color = clap::ColorChoice::Auto,
    about = format!("webterm {}: a server-side shell for browser terminals", crate_version!())
)]
pub struct Cli {
    #[arg(long, env = "WEBTERM_HOST", help = "Address to listen on. [default: 0.0.0.0]")]
    pub host: Option<IpAddr>,

    #[arg(short, long, env = "PORT", help = "Port to listen on. [default: 4000]")]
    pub port: Option<u16>,

    #[arg(
        long,
        env = "WEBTERM_SHELL",
        help = "Shell to spawn for each connection.",
        long_help = "Shell to spawn for each connection. Defaults to bash from PATH, falling back to /bin/sh."
    )]
    pub shell: Option<PathBuf>,

    #[arg(long, help = "Working directory for spawned shells. [default: $HOME]")]
    pub cwd: Option<PathBuf>,

    #[arg(
        long,
        help = "Initial terminal height. [default: 30]",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub rows: Option<u16>,

    #[arg(
        long,
        help = "Initial terminal width. [default: 80]",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub cols: Option<u16>,

    #[arg(short, long, env = "WEBTERM_CONFIG", help = "Path to a YAML config file.")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "WEBTERM_TRACE_FORMAT",
        help = "Configure the output format of traces.",
        default_value_t,
        value_enum
    )]
    pub trace_format: TraceFormat,

    #[arg(short, long, help = "Enable additional debug logs.")]
    pub verbose: bool,

    #[arg(short, long, conflicts_with = "verbose", help = "Only log errors.")]
    pub quiet: bool,
}

impl Cli {
    pub fn level(&self) -> Level {
        if self.verbose {
            Level::Debug
        } else if self.quiet {
            Level::Error
        } else {
            Level::Info
        }
    }
}
