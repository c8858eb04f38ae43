//! Per-address failure tracking and block decisions.
//!
//! Each address moves through three states: unknown (no record), tracking
//! (counting failures inside a sliding window) and blocked. Transitions for
//! one address are serialized by the record's slot lock; the firewall and
//! audit calls that a transition produces always run after that lock is
//! released.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::event::{AuthEvent, Outcome, Timestamp};
use crate::firewall::BlocklistController;
use crate::persistence::{AuditRow, PersistenceAdapter};
use crate::store::{ConcurrentKeyStore, Visit};

/// Tracking state for one source address. Exists only while there is
/// something to remember: records are created on a failure and removed by
/// the sweep (or by a successful login).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Failures counted in the current window; at least 1 while the record
    /// exists.
    pub failure_count: u32,
    /// When the current counting window opened.
    pub window_start: Timestamp,
    /// Set exactly when the block transition happened; `Some` iff the
    /// address is currently blocked.
    pub blocked_until: Option<Timestamp>,
    /// Most recent event touching this record.
    pub last_activity: Timestamp,
}

impl AttemptRecord {
    fn first_failure(now: Timestamp) -> Self {
        Self { failure_count: 1, window_start: now, blocked_until: None, last_activity: now }
    }

    pub fn is_blocked(&self, now: Timestamp) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    /// Advance the state machine for one failure. `fresh` marks a record
    /// that was just created for this very failure, so the count is already
    /// in place and only the threshold check remains.
    fn register_failure(
        &mut self,
        now: Timestamp,
        window_secs: u64,
        block_secs: u64,
        threshold: u32,
        fresh: bool,
    ) -> Decision {
        self.last_activity = now;
        if self.blocked_until.is_some() {
            // Already blocked: the external call happened on the original
            // transition and must not repeat.
            return Decision::AlreadyBlocked;
        }
        if !fresh {
            if now.saturating_sub(self.window_start) > window_secs {
                // Window slid past without reaching the threshold; start over
                // instead of accumulating forever.
                self.failure_count = 1;
                self.window_start = now;
            } else {
                self.failure_count += 1;
            }
        }
        if self.failure_count >= threshold {
            let until = now.saturating_add(block_secs);
            self.blocked_until = Some(until);
            Decision::Block { until }
        } else {
            Decision::Tracking { count: self.failure_count }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Tracking { count: u32 },
    Block { until: Timestamp },
    AlreadyBlocked,
}

/// Outcome summary of one cleanup sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    /// Blocked records whose block expired this sweep.
    pub expired: usize,
    /// Expired records actually unblocked and removed.
    pub unblocked: usize,
    /// Never-blocked records dropped for inactivity.
    pub idle_removed: usize,
}

/// Failure-counting state machine over every observed address.
pub struct AttemptTracker {
    store: ConcurrentKeyStore<String, AttemptRecord>,
    firewall: Arc<dyn BlocklistController>,
    audit: Arc<dyn PersistenceAdapter>,
    allowlist: HashSet<String>,
    threshold: u32,
    window_secs: u64,
    block_secs: u64,
    idle_retention_secs: u64,
}

impl AttemptTracker {
    pub fn new(
        config: &GuardConfig,
        firewall: Arc<dyn BlocklistController>,
        audit: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        Self {
            store: ConcurrentKeyStore::new(),
            firewall,
            audit,
            allowlist: config.allow_set(),
            threshold: config.max_attempts,
            window_secs: config.window_secs,
            block_secs: config.block_secs,
            idle_retention_secs: config.idle_retention_secs,
        }
    }

    /// Number of currently tracked addresses.
    pub fn tracked(&self) -> usize {
        self.store.len()
    }

    /// Dispatch one parsed event.
    pub async fn handle_event(&self, event: &AuthEvent) {
        match event.outcome {
            Outcome::Failure => self.record_failure(&event.address, event.timestamp).await,
            Outcome::Success => self.record_success(&event.address, event.timestamp).await,
        }
    }

    /// Record one failed attempt and block the address once it crosses the
    /// threshold inside the window.
    pub async fn record_failure(&self, address: &str, now: Timestamp) {
        if self.allowlist.contains(address) {
            // Hard override: an allowlisted address never transitions to
            // blocked, only its activity time is refreshed.
            if let Some(handle) = self.store.get(address) {
                let _ = handle.update(|rec| rec.last_activity = now);
            }
            debug!(address, "failure from allowlisted address ignored");
            self.audit_event(address, Outcome::Failure, false).await;
            return;
        }

        let decision = loop {
            let (handle, fresh) = self
                .store
                .get_or_create(address.to_string(), || AttemptRecord::first_failure(now));
            let decision = handle.update(|rec| {
                rec.register_failure(now, self.window_secs, self.block_secs, self.threshold, fresh)
            });
            match decision {
                Some(decision) => break decision,
                // The sweep removed the entry between lookup and update;
                // re-resolve and count this failure against a fresh record.
                None => continue,
            }
        };

        // The record already carries blocked_until; only now, outside every
        // lock, do the slow external calls.
        let blocked = match decision {
            Decision::Block { until } => {
                info!(address, until, "failure threshold reached, blocking");
                if let Err(e) = self.firewall.block(address).await {
                    warn!(address, error = %e, "block call failed");
                }
                true
            }
            Decision::AlreadyBlocked => true,
            Decision::Tracking { count } => {
                debug!(address, count, threshold = self.threshold, "failed attempt recorded");
                false
            }
        };
        self.audit_event(address, Outcome::Failure, blocked).await;
    }

    /// Record a successful login. Policy: success exonerates, the failure
    /// record is dropped. The exception is a record that was blocked: it
    /// stays, even past its expiry time, so the sweep still issues the
    /// firewall unblock before the record is removed.
    pub async fn record_success(&self, address: &str, now: Timestamp) {
        let removed = self.store.remove_if(address, |rec| rec.blocked_until.is_none());
        if removed {
            debug!(address, "successful login cleared failure history");
        }
        self.audit_event(address, Outcome::Success, self.is_blocked(address, now)).await;
    }

    /// Synchronous view of the blocking state, independent of the firewall.
    pub fn is_blocked(&self, address: &str, now: Timestamp) -> bool {
        self.store
            .get(address)
            .and_then(|handle| handle.read(|rec| rec.is_blocked(now)))
            .unwrap_or(false)
    }

    /// One cleanup pass over every record.
    ///
    /// Phase one, under the store's iteration lock: drop idle never-blocked
    /// records and collect addresses whose block has expired. Phase two,
    /// lock-free: unblock each expired address at the firewall and remove
    /// its record only when that call succeeds, so a transient firewall
    /// failure is retried on the next sweep.
    pub async fn sweep(&self, now: Timestamp) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut expired: Vec<String> = Vec::new();
        let mut idle_removed = 0usize;

        self.store.for_each_safe(|address, rec| match rec.blocked_until {
            Some(until) if now >= until => {
                expired.push(address.clone());
                Visit::Keep
            }
            Some(_) => Visit::Keep,
            None if now.saturating_sub(rec.last_activity) >= self.idle_retention_secs => {
                idle_removed += 1;
                Visit::Remove
            }
            None => Visit::Keep,
        });
        stats.idle_removed = idle_removed;
        stats.expired = expired.len();

        for address in expired {
            match self.firewall.unblock(&address).await {
                Ok(()) => {
                    let removed = self
                        .store
                        .remove_if(&address, |rec| rec.blocked_until.is_some_and(|u| now >= u));
                    if removed {
                        stats.unblocked += 1;
                        info!(address = %address, "block expired, address unblocked");
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "unblock failed, will retry next sweep");
                }
            }
        }

        self.store.compact();
        stats
    }

    /// Re-enter still-blocked rows from the audit store after a restart and
    /// re-issue the firewall calls rather than trusting the old state
    /// survived.
    pub async fn rehydrate(&self, rows: Vec<AuditRow>, now: Timestamp) -> usize {
        let mut restored = 0;
        for row in rows {
            if !row.blocked || self.allowlist.contains(&row.address) {
                continue;
            }
            let blocked_at = row.last_attempt.timestamp().max(0) as Timestamp;
            let until = blocked_at.saturating_add(self.block_secs);
            if until <= now {
                continue;
            }
            let (handle, fresh) = self.store.get_or_create(row.address.clone(), || {
                AttemptRecord {
                    failure_count: u32::try_from(row.attempt_count).unwrap_or(u32::MAX).max(1),
                    window_start: blocked_at,
                    blocked_until: Some(until),
                    last_activity: blocked_at,
                }
            });
            if !fresh {
                let _ = handle.update(|rec| rec.blocked_until = Some(until));
            }
            if let Err(e) = self.firewall.block(&row.address).await {
                warn!(address = %row.address, error = %e, "rehydration block call failed");
            }
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "rehydrated blocked addresses from audit store");
        }
        restored
    }

    async fn audit_event(&self, address: &str, outcome: Outcome, blocked: bool) {
        let now: DateTime<Utc> = Utc::now();
        if let Err(e) = self.audit.upsert(address, outcome, blocked, now).await {
            // Audit is advisory; in-memory state stays authoritative.
            warn!(address, error = %e, "audit write failed");
        }
    }
}

impl std::fmt::Debug for AttemptTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptTracker")
            .field("tracked", &self.store.len())
            .field("threshold", &self.threshold)
            .field("window_secs", &self.window_secs)
            .field("block_secs", &self.block_secs)
            .finish()
    }
}
