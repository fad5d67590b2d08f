//! Session configuration (`tether.toml`)
//!
//! 優先順位: CLI フラグ > 設定ファイル > デフォルト値
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 12557
//! api_version = "2018-06-01"
//! artifacts_dir = ".tether/artifacts"
//! stop_grace_ms = 3000
//! invocation_timeout_ms = 900000
//! # next_poll_timeout_ms = 30000
//! log_level = "info"
//! ```

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::server::{DEFAULT_API_VERSION, ServerOptions};
use crate::domain::TetherError;

pub const DEFAULT_CONFIG_FILE: &str = "tether.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub api_version: String,
    pub artifacts_dir: PathBuf,
    pub stop_grace_ms: u64,
    pub invocation_timeout_ms: u64,
    pub next_poll_timeout_ms: Option<u64>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12557,
            api_version: DEFAULT_API_VERSION.to_string(),
            artifacts_dir: PathBuf::from(".tether/artifacts"),
            stop_grace_ms: 3000,
            invocation_timeout_ms: 900_000,
            next_poll_timeout_ms: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TetherError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&contents)
            .map_err(|e| TetherError::Config(format!("{}: {e}", path.display())))
    }

    pub fn parse(contents: &str) -> Result<Self, TetherError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| TetherError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// `explicit` must exist; otherwise `tether.toml` in `dir` is used when present.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self, TetherError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            tracing::info!(path = %candidate.display(), "loaded configuration");
            return Self::load(candidate);
        }
        Ok(Self::default())
    }

    pub fn validate(&self) -> Result<(), TetherError> {
        self.addr()?;
        if self.api_version.trim().is_empty() {
            return Err(TetherError::Config("api_version must not be empty".into()));
        }
        if self.invocation_timeout_ms == 0 {
            return Err(TetherError::Config(
                "invocation_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn addr(&self) -> Result<SocketAddr, TetherError> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| TetherError::Config(format!("invalid host: {}", self.host)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            api_version: self.api_version.clone(),
            invocation_timeout: self.invocation_timeout(),
            poll_timeout: self.next_poll_timeout_ms.map(Duration::from_millis),
        }
    }
}
