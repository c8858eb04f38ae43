//! Firewall-level block list management.
//!
//! The tracker and sweeper only ever talk to [`BlocklistController`]; the
//! real implementation drives an ipset through child processes, the same
//! mechanism the daemon's predecessors used, while tests assert against
//! [`RecordingController`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::GuardError;

/// External packet-filter control. Both calls are idempotent from the
/// caller's point of view: blocking an already-blocked address or unblocking
/// an absent one must not error.
#[async_trait]
pub trait BlocklistController: Send + Sync {
    async fn block(&self, address: &str) -> Result<(), GuardError>;
    async fn unblock(&self, address: &str) -> Result<(), GuardError>;
}

/// Kernel IP set managed via the `ipset` and `iptables` binaries.
pub struct IpsetController {
    set_name: String,
    timeout_secs: u64,
}

impl IpsetController {
    pub fn new(set_name: impl Into<String>, timeout_secs: u64) -> Self {
        Self { set_name: set_name.into(), timeout_secs }
    }

    /// Create the set (tolerating an existing one) and install the DROP rule
    /// matching it. Called once at startup.
    pub async fn ensure_chain(&self) -> Result<(), GuardError> {
        run_checked(
            "ipset",
            &[
                "create",
                "-exist",
                &self.set_name,
                "hash:ip",
                "timeout",
                &self.timeout_secs.to_string(),
            ],
        )
        .await?;

        let match_args =
            ["INPUT", "-m", "set", "--match-set", &self.set_name, "src", "-j", "DROP"];
        let mut check = vec!["-C"];
        check.extend_from_slice(&match_args);
        if run_checked("iptables", &check).await.is_err() {
            let mut append = vec!["-A"];
            append.extend_from_slice(&match_args);
            run_checked("iptables", &append).await?;
        }
        info!(set = %self.set_name, "firewall chain ready");
        Ok(())
    }
}

#[async_trait]
impl BlocklistController for IpsetController {
    async fn block(&self, address: &str) -> Result<(), GuardError> {
        // -exist makes re-adding a present entry a no-op.
        run_checked("ipset", &["add", "-exist", &self.set_name, address]).await?;
        info!(address, set = %self.set_name, "address blocked");
        Ok(())
    }

    async fn unblock(&self, address: &str) -> Result<(), GuardError> {
        run_checked("ipset", &["del", "-exist", &self.set_name, address]).await?;
        info!(address, set = %self.set_name, "address unblocked");
        Ok(())
    }
}

async fn run_checked(program: &str, args: &[&str]) -> Result<(), GuardError> {
    let output = Command::new(program).args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(GuardError::Firewall(format!(
        "{program} {}: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

/// Log-only controller for running without firewall privileges.
pub struct NullController;

#[async_trait]
impl BlocklistController for NullController {
    async fn block(&self, address: &str) -> Result<(), GuardError> {
        debug!(address, "block suppressed (no-firewall mode)");
        Ok(())
    }

    async fn unblock(&self, address: &str) -> Result<(), GuardError> {
        debug!(address, "unblock suppressed (no-firewall mode)");
        Ok(())
    }
}

/// One observed controller call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallCall {
    Block(String),
    Unblock(String),
}

/// In-memory fake that records every call so tests can assert exact
/// block/unblock counts and arguments.
#[derive(Default)]
pub struct RecordingController {
    calls: Mutex<Vec<FirewallCall>>,
    fail_unblock: AtomicBool,
}

impl RecordingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<FirewallCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn block_count(&self, address: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FirewallCall::Block(a) if a == address))
            .count()
    }

    pub fn unblock_count(&self, address: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, FirewallCall::Unblock(a) if a == address))
            .count()
    }

    /// Make subsequent `unblock` calls fail, for exercising the sweeper's
    /// retry path.
    pub fn set_fail_unblock(&self, fail: bool) {
        self.fail_unblock.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlocklistController for RecordingController {
    async fn block(&self, address: &str) -> Result<(), GuardError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FirewallCall::Block(address.to_string()));
        Ok(())
    }

    async fn unblock(&self, address: &str) -> Result<(), GuardError> {
        if self.fail_unblock.load(Ordering::SeqCst) {
            return Err(GuardError::Firewall(format!("injected unblock failure for {address}")));
        }
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FirewallCall::Unblock(address.to_string()));
        Ok(())
    }
}
