//! Server configuration.
//!
//! Defaults reproduce the fixed deployment of the reference board. A JSON file
//! may override any subset of fields; the server binary applies CLI flags on
//! top of that.

use crate::scheduler::{RateError, RateSelector, DEFAULT_RATE_INDEX, DEFAULT_RATE_TABLE};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_TCP_PORT: u16 = 10000;
pub const DEFAULT_UDP_LOCAL_PORT: u16 = 10001;
pub const DEFAULT_UDP_REMOTE_PORT: u16 = 10001;
const DEFAULT_QUIT_LINGER_MS: u64 = 1000;
const DEFAULT_KILL_LINGER_MS: u64 = 2000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid rate table: {0}")]
    Rates(#[from] RateError),
    #[error("write timeout must be non-zero")]
    ZeroWriteTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub tcp_port: u16,
    /// Local port the telemetry socket binds to; 0 picks an ephemeral port.
    pub udp_local_port: u16,
    /// Port on the connected peer that receives telemetry.
    pub udp_remote_port: u16,
    /// Packets per second selectable with `pu1`..`pu9`.
    pub rate_table: Vec<u32>,
    pub default_rate_index: usize,
    pub quit_linger_ms: u64,
    pub kill_linger_ms: u64,
    pub write_timeout_ms: u64,
    /// Re-seed the tick deadline on each accept instead of once at startup.
    pub resync_on_accept: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: DEFAULT_TCP_PORT,
            udp_local_port: DEFAULT_UDP_LOCAL_PORT,
            udp_remote_port: DEFAULT_UDP_REMOTE_PORT,
            rate_table: DEFAULT_RATE_TABLE.to_vec(),
            default_rate_index: DEFAULT_RATE_INDEX,
            quit_linger_ms: DEFAULT_QUIT_LINGER_MS,
            kill_linger_ms: DEFAULT_KILL_LINGER_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            resync_on_accept: false,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rate_selector()?;
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        Ok(())
    }

    pub fn rate_selector(&self) -> Result<RateSelector, ConfigError> {
        Ok(RateSelector::new(&self.rate_table, self.default_rate_index)?)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.tcp_port)
    }

    pub fn udp_local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.udp_local_port)
    }

    pub fn quit_linger(&self) -> Duration {
        Duration::from_millis(self.quit_linger_ms)
    }

    pub fn kill_linger(&self) -> Duration {
        Duration::from_millis(self.kill_linger_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_deployment() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tcp_addr().port(), 10000);
        assert_eq!(config.udp_local_addr().port(), 10001);
        assert_eq!(config.udp_remote_port, 10001);
        assert_eq!(config.rate_selector().unwrap().rate(), 10);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{"tcp_port": 12000, "rate_table": [2, 4, 8], "default_rate_index": 1}"#,
        )
        .unwrap();

        assert_eq!(config.tcp_port, 12000);
        assert_eq!(config.udp_remote_port, DEFAULT_UDP_REMOTE_PORT);
        assert_eq!(config.rate_selector().unwrap().rate(), 4);
        assert_eq!(config.quit_linger(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        assert!(matches!(
            ServerConfig::from_json_str(r#"{"rate_table": []}"#),
            Err(ConfigError::Rates(RateError::EmptyTable))
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{"default_rate_index": 9}"#),
            Err(ConfigError::Rates(RateError::IndexOutOfRange { index: 9, len: 9 }))
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{"write_timeout_ms": 0}"#),
            Err(ConfigError::ZeroWriteTimeout)
        ));
        assert!(matches!(
            ServerConfig::from_json_str(r#"{"tcp_prot": 1}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = ServerConfig::load(Path::new("/nonexistent/gpiolink.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
