//! Durable audit trail of authentication attempts.
//!
//! Persistence is an audit and restart-recovery aid, never the authority for
//! live blocking decisions: a write failure is logged and the daemon keeps
//! operating from memory.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::GuardError;
use crate::event::Outcome;

/// One audit row, keyed by source address.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AuditRow {
    pub address: String,
    pub attempt_count: i64,
    pub last_attempt: DateTime<Utc>,
    pub last_success: Option<DateTime<Utc>>,
    pub blocked: bool,
}

/// Audit sink plus the startup read-back used for rehydration.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Record one attempt. Inserts on first sight, otherwise bumps the
    /// counter and the relevant timestamps.
    async fn upsert(
        &self,
        address: &str,
        outcome: Outcome,
        blocked: bool,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError>;

    /// Read every row. Only called at startup.
    async fn load_all(&self) -> Result<Vec<AuditRow>, GuardError>;
}

/// SQLite-backed audit store.
pub struct SqliteAudit {
    pool: SqlitePool,
}

impl SqliteAudit {
    pub async fn connect(path: &Path) -> Result<Self, GuardError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logins ( \
                 address TEXT PRIMARY KEY, \
                 attempt_count INTEGER NOT NULL, \
                 last_attempt TEXT NOT NULL, \
                 last_success TEXT, \
                 blocked INTEGER NOT NULL DEFAULT 0 \
             )",
        )
        .execute(&pool)
        .await?;
        debug!(path = %path.display(), "audit store ready");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl PersistenceAdapter for SqliteAudit {
    async fn upsert(
        &self,
        address: &str,
        outcome: Outcome,
        blocked: bool,
        now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        let success_time = match outcome {
            Outcome::Success => Some(now),
            Outcome::Failure => None,
        };
        sqlx::query(
            "INSERT INTO logins (address, attempt_count, last_attempt, last_success, blocked) \
             VALUES (?1, 1, ?2, ?3, ?4) \
             ON CONFLICT(address) DO UPDATE SET \
                 attempt_count = attempt_count + 1, \
                 last_attempt = excluded.last_attempt, \
                 last_success = COALESCE(excluded.last_success, logins.last_success), \
                 blocked = excluded.blocked",
        )
        .bind(address)
        .bind(now)
        .bind(success_time)
        .bind(blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditRow>, GuardError> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT address, attempt_count, last_attempt, last_success, blocked FROM logins",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// No-op adapter for tests and audit-less operation.
pub struct NullAudit;

#[async_trait]
impl PersistenceAdapter for NullAudit {
    async fn upsert(
        &self,
        _address: &str,
        _outcome: Outcome,
        _blocked: bool,
        _now: DateTime<Utc>,
    ) -> Result<(), GuardError> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AuditRow>, GuardError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn fixture() -> (TempDir, SqliteAudit) {
        let dir = TempDir::new().expect("tempdir");
        let audit = SqliteAudit::connect(&dir.path().join("audit.db"))
            .await
            .expect("connect");
        (dir, audit)
    }

    #[tokio::test]
    async fn upsert_inserts_then_increments() {
        let (_dir, audit) = fixture().await;
        let now = Utc::now();

        audit.upsert("10.0.0.1", Outcome::Failure, false, now).await.unwrap();
        audit.upsert("10.0.0.1", Outcome::Failure, false, now).await.unwrap();
        audit.upsert("10.0.0.1", Outcome::Failure, true, now).await.unwrap();

        let rows = audit.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, "10.0.0.1");
        assert_eq!(rows[0].attempt_count, 3);
        assert!(rows[0].blocked);
        assert!(rows[0].last_success.is_none());
    }

    #[tokio::test]
    async fn success_sets_last_success_and_failure_keeps_it() {
        let (_dir, audit) = fixture().await;
        let now = Utc::now();

        audit.upsert("10.0.0.2", Outcome::Success, false, now).await.unwrap();
        audit.upsert("10.0.0.2", Outcome::Failure, false, now).await.unwrap();

        let rows = audit.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].attempt_count, 2);
        // A later failure must not erase the recorded success time.
        assert!(rows[0].last_success.is_some());
        assert!(!rows[0].blocked);
    }

    #[tokio::test]
    async fn load_all_returns_every_address() {
        let (_dir, audit) = fixture().await;
        let now = Utc::now();
        for i in 0..5 {
            audit
                .upsert(&format!("192.0.2.{i}"), Outcome::Failure, false, now)
                .await
                .unwrap();
        }
        let rows = audit.load_all().await.unwrap();
        assert_eq!(rows.len(), 5);
    }
}
