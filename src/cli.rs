//! Command-line surface. Flags override whatever the config file and
//! environment provided.

use std::path::PathBuf;

use clap::Parser;

use crate::config::GuardConfig;

#[derive(Debug, Parser)]
#[command(
    name = "authguard",
    version,
    about = "Brute-force login protection: watches authentication logs and blocks repeat offenders at the firewall"
)]
pub struct Cli {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Syslog identifier to monitor.
    #[arg(long)]
    pub service: Option<String>,

    /// Failures within the window before blocking.
    #[arg(short = 'n', long)]
    pub max_attempts: Option<u32>,

    /// Failure-counting window in seconds.
    #[arg(long)]
    pub window_secs: Option<u64>,

    /// Block duration in seconds.
    #[arg(short = 't', long)]
    pub block_secs: Option<u64>,

    /// Seconds between cleanup sweeps.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Seconds of inactivity before an unblocked record is dropped.
    #[arg(long)]
    pub idle_retention_secs: Option<u64>,

    /// Address that must never be blocked. Repeatable.
    #[arg(long = "allow", value_name = "IP")]
    pub allow: Vec<String>,

    /// Audit database path.
    #[arg(long, env = "DB_PATH", value_name = "FILE")]
    pub db_path: Option<PathBuf>,

    /// Kernel IP set name.
    #[arg(long)]
    pub ipset_name: Option<String>,

    /// Log blocking decisions without touching the firewall.
    #[arg(long)]
    pub no_firewall: bool,

    /// Skip reloading still-blocked addresses from the audit store.
    #[arg(long)]
    pub no_rehydrate: bool,
}

impl Cli {
    /// Layer present flags over `config`.
    pub fn apply(&self, config: &mut GuardConfig) {
        if let Some(service) = &self.service {
            config.service = service.clone();
        }
        if let Some(n) = self.max_attempts {
            config.max_attempts = n;
        }
        if let Some(secs) = self.window_secs {
            config.window_secs = secs;
        }
        if let Some(secs) = self.block_secs {
            config.block_secs = secs;
        }
        if let Some(secs) = self.sweep_interval_secs {
            config.sweep_interval_secs = secs;
        }
        if let Some(secs) = self.idle_retention_secs {
            config.idle_retention_secs = secs;
        }
        if !self.allow.is_empty() {
            config.allowlist.extend(self.allow.iter().cloned());
        }
        if let Some(path) = &self.db_path {
            config.db_path = path.clone();
        }
        if let Some(name) = &self.ipset_name {
            config.ipset_name = name.clone();
        }
    }
}
