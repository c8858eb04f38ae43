//! Daemon configuration.
//!
//! Precedence: built-in defaults, then an optional TOML file, then
//! `AUTHGUARD_*` environment variables, then command-line flags (applied by
//! the CLI layer on top of the loaded value).

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GuardError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Syslog identifier whose journal lines are monitored.
    pub service: String,
    /// Failures within the window before an address is blocked.
    pub max_attempts: u32,
    /// Sliding window for counting failures, in seconds.
    pub window_secs: u64,
    /// How long a block lasts, in seconds.
    pub block_secs: u64,
    /// Interval between cleanup sweeps, in seconds.
    pub sweep_interval_secs: u64,
    /// Idle time after which a never-blocked record is dropped, in seconds.
    pub idle_retention_secs: u64,
    /// Addresses that are never blocked, whatever their failure count.
    pub allowlist: Vec<String>,
    /// SQLite audit database location.
    pub db_path: PathBuf,
    /// Name of the kernel IP set holding blocked addresses.
    pub ipset_name: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            service: "sshd".to_string(),
            max_attempts: 3,
            window_secs: 300,
            block_secs: 1800,
            sweep_interval_secs: 60,
            idle_retention_secs: 600,
            allowlist: Vec::new(),
            db_path: PathBuf::from("ip_logins.db"),
            ipset_name: "authguard_blocklist".to_string(),
        }
    }
}

impl GuardConfig {
    /// Load defaults, then the optional config file, then environment
    /// overrides. CLI flags are layered on afterwards by the caller.
    pub fn load(path: Option<&Path>) -> Result<Self, GuardError> {
        let defaults = config::Config::try_from(&GuardConfig::default())
            .map_err(|e| GuardError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(config::Environment::with_prefix("AUTHGUARD"));
        let settings = builder.build().map_err(|e| GuardError::Config(e.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|e| GuardError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if self.max_attempts == 0 {
            return Err(GuardError::Config("max_attempts must be at least 1".into()));
        }
        for (name, value) in [
            ("window_secs", self.window_secs),
            ("block_secs", self.block_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("idle_retention_secs", self.idle_retention_secs),
        ] {
            if value == 0 {
                return Err(GuardError::Config(format!("{name} must be positive")));
            }
        }
        if self.service.is_empty() {
            return Err(GuardError::Config("service must not be empty".into()));
        }
        for addr in &self.allowlist {
            if addr.parse::<IpAddr>().is_err() {
                return Err(GuardError::Config(format!(
                    "allowlist entry is not an IP address: {addr}"
                )));
            }
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Allowlist as a set for O(1) membership checks on the event path.
    pub fn allow_set(&self) -> HashSet<String> {
        self.allowlist.iter().cloned().collect()
    }
}
