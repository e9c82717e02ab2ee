//! Configuration management for netpin.
//!
//! A YAML file provides the base configuration, CLI flags override it, and
//! [`Config::into_settings`] validates the result into the immutable
//! [`Settings`] the controller is built from.

use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NetpinError;
use crate::lock::{LockConfig, DEFAULT_LOCK_FILE, DEFAULT_LOCK_NAME, LOCK_POLL_INTERVAL, LOCK_TIMEOUT};
use crate::reconciler::Locking;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/netpin/config.yaml";

/// Longest accepted reconciliation interval.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local address the proxy listens on (required)
    pub ip_address: String,

    /// Local TCP port the proxy listens on
    pub local_port: u16,

    /// Interface the address is bound to
    pub interface: String,

    /// Reconciliation interval (e.g. "5s", "1m")
    pub interval: String,

    /// Manage the iptables rule battery
    pub setup_iptables: bool,

    /// Keep re-asserting rules and address until signalled
    pub daemon: bool,

    /// Remove rules and address on exit
    pub cleanup: bool,

    /// Hold the host-wide xtables lock around every iptables invocation.
    /// When false, iptables is run with `-w` and serializes itself.
    ///
    /// Set this to false on iptables-legacy hosts: legacy iptables flocks
    /// the same lock file itself, so while we hold it every invocation
    /// fails with "holding the xtables lock" and no rule is ever installed.
    pub host_lock: bool,

    /// xtables lock file
    pub lock_file: PathBuf,

    /// Abstract socket name of the legacy xtables lock (without `@`)
    pub lock_name: String,

    /// iptables binary; defaults to iptables or ip6tables by address family
    pub iptables_path: Option<String>,

    /// iproute2 `ip` binary
    pub ip_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip_address: String::new(),
            local_port: 443,
            interface: "lo".to_string(),
            interval: "30s".to_string(),
            setup_iptables: true,
            daemon: true,
            cleanup: true,
            host_lock: true,
            lock_file: PathBuf::from(DEFAULT_LOCK_FILE),
            lock_name: DEFAULT_LOCK_NAME.to_string(),
            iptables_path: None,
            ip_path: "ip".to_string(),
        }
    }
}

/// Validated, immutable runtime settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Host prefix (/32 or /128) of the configured address
    pub address: IpNet,
    pub local_port: u16,
    pub interface: String,
    pub interval: Duration,
    pub setup_iptables: bool,
    pub daemon: bool,
    pub cleanup: bool,
    pub locking: Locking,
    pub iptables_path: String,
    pub ip_path: String,
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;
        Ok(config)
    }

    /// Load `path` if given (must exist), else the default path if present,
    /// else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), NetpinError> {
        parse_address(&self.ip_address)?;
        parse_interval(&self.interval)?;

        if self.local_port == 0 {
            return Err(NetpinError::Config("local_port must be non-zero".to_string()));
        }
        if self.interface.trim().is_empty() {
            return Err(NetpinError::Config("interface must not be empty".to_string()));
        }
        if self.host_lock && self.lock_name.is_empty() {
            return Err(NetpinError::Config("lock_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Validate and resolve into [`Settings`].
    pub fn into_settings(self) -> Result<Settings, NetpinError> {
        self.validate()?;

        let ip = parse_address(&self.ip_address)?;
        let interval = parse_interval(&self.interval)?;
        let locking = if self.host_lock {
            Locking::Host(LockConfig {
                file: self.lock_file,
                abstract_name: self.lock_name,
                poll_interval: LOCK_POLL_INTERVAL,
                timeout: LOCK_TIMEOUT,
            })
        } else {
            Locking::ToolWait(LOCK_TIMEOUT)
        };
        let iptables_path = self.iptables_path.unwrap_or_else(|| {
            match ip {
                IpAddr::V4(_) => "iptables",
                IpAddr::V6(_) => "ip6tables",
            }
            .to_string()
        });

        Ok(Settings {
            address: IpNet::from(ip),
            local_port: self.local_port,
            interface: self.interface,
            interval,
            setup_iptables: self.setup_iptables,
            daemon: self.daemon,
            cleanup: self.cleanup,
            locking,
            iptables_path,
            ip_path: self.ip_path,
        })
    }
}

/// Parse the configured local address.
pub fn parse_address(s: &str) -> Result<IpAddr, NetpinError> {
    if s.is_empty() {
        return Err(NetpinError::Config("ip_address is required".to_string()));
    }
    s.trim()
        .parse()
        .map_err(|_| NetpinError::Config(format!("unable to parse IP address {:?}", s)))
}

/// Parse an interval like "5s", "30m", "1h" into a non-zero duration of at
/// most [`MAX_INTERVAL`].
///
/// Requires ASCII-only input to prevent Unicode-related edge cases.
pub fn parse_interval(interval: &str) -> Result<Duration, NetpinError> {
    let invalid = || {
        NetpinError::Config(format!(
            "invalid interval {:?}; use a format like '5s', '30m', '1h'",
            interval
        ))
    };

    if !interval.is_ascii() || interval.len() < 2 {
        return Err(invalid());
    }

    let (num_part, suffix) = interval.split_at(interval.len() - 1);
    let n: u64 = num_part.parse().map_err(|_| invalid())?;
    let secs = match suffix {
        "s" => n,
        "m" => n.checked_mul(60).ok_or_else(invalid)?,
        "h" => n.checked_mul(3600).ok_or_else(invalid)?,
        _ => return Err(invalid()),
    };
    if secs == 0 {
        return Err(NetpinError::Config("interval must be non-zero".to_string()));
    }
    if secs > MAX_INTERVAL.as_secs() {
        return Err(NetpinError::Config(format!(
            "interval {:?} exceeds the maximum of {}h",
            interval,
            MAX_INTERVAL.as_secs() / 3600
        )));
    }
    Ok(Duration::from_secs(secs))
}
