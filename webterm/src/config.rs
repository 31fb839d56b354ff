//! Server settings, merged from built-in defaults, an optional YAML file and
//! the command line, in increasing order of precedence.

use crate::cli::Cli;
use crate::gateway::GatewayConfig;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use webterm_bridge::BridgeConfig;
use webterm_pty::{DEFAULT_COLS, DEFAULT_OUTPUT_CAPACITY, DEFAULT_ROWS, SpawnConfig, TermSize};

pub const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("terminal size must be at least 1x1, got {cols}x{rows}")]
    InvalidSize { rows: u16, cols: u16 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// The YAML config file. Every key is optional.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub shell: Option<PathBuf>,
    #[serde(default)]
    pub shell_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    /// Extra environment for spawned shells.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub ping_interval_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
    pub max_message_bytes: Option<usize>,
    /// Output chunks buffered per shell before the PTY reader waits.
    pub output_buffer: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        // An empty file is an empty config.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved settings for one server run.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub bridge: BridgeConfig,
    pub gateway: GatewayConfig,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load the config file named on the command line, if any, and merge.
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let host = cli.host.or(file.host).unwrap_or(DEFAULT_HOST);
        let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);

        let rows = cli.rows.or(file.rows).unwrap_or(DEFAULT_ROWS);
        let cols = cli.cols.or(file.cols).unwrap_or(DEFAULT_COLS);
        let size = TermSize::new(rows, cols).ok_or(ConfigError::InvalidSize { rows, cols })?;

        let mut spawn = match cli.shell.clone().or(file.shell) {
            Some(shell) => SpawnConfig::new(shell),
            None => SpawnConfig::default(),
        };
        for arg in file.shell_args {
            spawn = spawn.arg(arg);
        }
        if let Some(cwd) = cli.cwd.clone().or(file.cwd) {
            spawn = spawn.cwd(cwd);
        }
        for (key, value) in file.env {
            spawn = spawn.env(key, value);
        }
        spawn = spawn.size(size);
        spawn.output_capacity = positive(
            "outputBuffer",
            file.output_buffer.unwrap_or(DEFAULT_OUTPUT_CAPACITY),
        )?;

        let defaults = BridgeConfig::default();
        let ping_interval = match file.ping_interval_secs {
            Some(secs) => Duration::from_secs(positive("pingIntervalSecs", secs)?),
            None => defaults.ping_interval,
        };
        let bridge = BridgeConfig {
            spawn,
            ping_interval,
            ..defaults
        };

        let gateway_defaults = GatewayConfig::default();
        let gateway = GatewayConfig {
            idle_timeout: match file.idle_timeout_secs {
                Some(secs) => Duration::from_secs(positive("idleTimeoutSecs", secs)?),
                None => gateway_defaults.idle_timeout,
            },
            max_message_bytes: positive(
                "maxMessageBytes",
                file.max_message_bytes
                    .unwrap_or(gateway_defaults.max_message_bytes),
            )?,
        };

        let shutdown_grace = match file.shutdown_grace_ms {
            Some(ms) => Duration::from_millis(positive("shutdownGraceMs", ms)?),
            None => DEFAULT_SHUTDOWN_GRACE,
        };

        Ok(Self {
            listen: SocketAddr::new(host, port),
            bridge,
            gateway,
            shutdown_grace,
        })
    }
}

fn positive<T: Default + PartialEq>(name: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        Err(ConfigError::Zero(name))
    } else {
        Ok(value)
    }
}
