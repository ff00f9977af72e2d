//! Gateway configuration — one `key=value` per line.
//!
//! Lines whose key is made of `[-_0-9a-zA-Z]` are recognized; everything
//! else (comments, blank lines, malformed lines) is ignored. Unknown keys
//! are ignored too, so a config file can be shared with other tools.

use std::path::{Path, PathBuf};

/// Default TCP port for the IRC listener.
pub const DEFAULT_PORT: u16 = 6667;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config file {path} does not set slack_token")]
    MissingToken { path: PathBuf },
    #[error("config file {path}: invalid port '{value}'")]
    InvalidPort { path: PathBuf, value: String },
}

/// Parsed gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream API credential (required).
    pub slack_token: String,
    /// IRC server password. When unset, PASS is not required.
    pub password: Option<String>,
    /// TCP port for the loopback IRC listener.
    pub port: u16,
    /// Unix socket path; when set, overrides `port` and the TCP binding.
    pub unix_socket: Option<PathBuf>,
    /// Wire-level logging of every IRC and RTM line.
    pub debug_dump: bool,
}

impl Config {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        let cfg = Self::parse(&content, path)?;
        Ok(cfg)
    }

    /// Parse config file contents. `path` is only used for error messages.
    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut slack_token = None;
        let mut password = None;
        let mut port = DEFAULT_PORT;
        let mut unix_socket = None;
        let mut debug_dump = false;

        for line in content.lines() {
            let Some((key, value)) = recognize(line) else {
                continue;
            };
            match key {
                "slack_token" => slack_token = Some(value.to_owned()),
                "password" => password = Some(value.to_owned()),
                "port" => {
                    port = value.parse().map_err(|_| ConfigError::InvalidPort {
                        path: path.to_owned(),
                        value: value.to_owned(),
                    })?;
                }
                "unix_socket" => unix_socket = Some(PathBuf::from(value)),
                "debug_dump" => debug_dump = value == "1",
                _ => {} // unknown keys are ignored
            }
        }

        let slack_token = slack_token.ok_or_else(|| ConfigError::MissingToken {
            path: path.to_owned(),
        })?;

        Ok(Self {
            slack_token,
            password,
            port,
            unix_socket,
            debug_dump,
        })
    }
}

/// Split a line into `(key, value)` if it matches `^[-_0-9a-zA-Z]+=.*$`.
fn recognize(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return None;
    }
    Some((key, value))
}
