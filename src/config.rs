use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

pub const SOCKS_PORT_DEFAULT: u16 = 29101;
pub const CONTROL_PORT_DEFAULT: u16 = 29151;

pub const MIN_RECONNECT_TIME: Duration = Duration::from_secs(60);
pub const MAX_CONNECT_WAIT_TIME: Duration = Duration::from_secs(120);
pub const STOP_ON_IDLE_TIME: Duration = Duration::from_secs(600);
pub const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(30);
pub const CONTROL_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Which daemon the bridge routes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonMode {
    /// Launch and own a local daemon process.
    Supervised,
    /// Use an externally managed SOCKS endpoint; no process supervision.
    External { socks_host: String, socks_port: u16 },
}

/// When the supervised daemon should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    /// Connect lazily on first admitted request instead of at startup.
    pub start_on_demand: bool,
    /// Close the connection after the idle window when nothing uses it.
    pub stop_on_idle: bool,
}

/// Host admission prompting behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPolicy {
    pub prompt_on_use: bool,
    /// Skip prompting for the operator's own domains.
    pub skip_operator_domains: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub mode: DaemonMode,
    pub lifecycle: LifecyclePolicy,
    pub prompt: PromptPolicy,

    /// Directory holding the daemon binary, its config file, data and
    /// service descriptors.
    pub daemon_dir: PathBuf,
    /// Daemon binary name inside `daemon_dir`.
    pub daemon_binary: String,

    /// Local SOCKS port for the supervised daemon. Zero means allocate one
    /// at startup.
    pub socks_port: u16,
    /// Local control port of the supervised daemon. Zero means allocate.
    pub control_port: u16,

    /// Enable hidden-service provisioning blocks in the daemon config.
    pub services_enabled: bool,

    /// Mirror daemon stdout into the log.
    pub debug_daemon: bool,

    /// `from=to` domain rewrite lines, one mapping per entry.
    pub domain_rewrites: Vec<String>,

    /// URL fetched by the proxy self-test.
    pub test_url: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: DaemonMode::Supervised,
            lifecycle: LifecyclePolicy {
                start_on_demand: true,
                stop_on_idle: true,
            },
            prompt: PromptPolicy {
                prompt_on_use: true,
                skip_operator_domains: true,
            },
            daemon_dir: PathBuf::from("."),
            daemon_binary: default_daemon_binary().to_string(),
            socks_port: 0,
            control_port: 0,
            services_enabled: false,
            debug_daemon: false,
            domain_rewrites: Vec::new(),
            test_url: "https://check.torproject.org/".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, BridgeError> {
        let raw = fs::read_to_string(path)?;
        let config: BridgeConfig = serde_json::from_str(&raw)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), BridgeError> {
        let raw =
            serde_json::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if let DaemonMode::External { socks_host, socks_port } = &self.mode {
            if socks_host.is_empty() {
                return Err(BridgeError::Config("external SOCKS host is empty".into()));
            }
            if *socks_port == 0 {
                return Err(BridgeError::Config("external SOCKS port is zero".into()));
            }
        }
        if self.daemon_binary.is_empty() {
            return Err(BridgeError::Config("daemon binary name is empty".into()));
        }
        Ok(())
    }

    pub fn is_external(&self) -> bool {
        matches!(self.mode, DaemonMode::External { .. })
    }

    pub fn config_file(&self) -> PathBuf {
        self.daemon_dir.join("config.txt")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.daemon_dir.join("data")
    }

    pub fn services_dir(&self) -> PathBuf {
        self.daemon_dir.join("services")
    }
}

fn default_daemon_binary() -> &'static str {
    if cfg!(windows) {
        "tor.exe"
    } else {
        "tor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn external_mode_requires_endpoint() {
        let mut config = BridgeConfig::default();
        config.mode = DaemonMode::External {
            socks_host: String::new(),
            socks_port: 9050,
        };
        assert!(config.validate().is_err());

        config.mode = DaemonMode::External {
            socks_host: "127.0.0.1".into(),
            socks_port: 0,
        };
        assert!(config.validate().is_err());

        config.mode = DaemonMode::External {
            socks_host: "127.0.0.1".into(),
            socks_port: 9050,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");

        let mut config = BridgeConfig::default();
        config.domain_rewrites.push("a.example=b.example".into());
        config.save(&path).unwrap();

        let loaded = BridgeConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
