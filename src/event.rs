//! Structured authentication events and the sources that deliver them.
//!
//! Sources hand over raw log lines in batches; an empty batch means "nothing
//! right now" and never terminates the stream. Parsing into [`AuthEvent`]s
//! happens downstream so the source stays interchangeable.

use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::GuardError;

/// Seconds since the Unix epoch. The core state machine works in plain
/// seconds so tests can drive virtual time without sleeping.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn unix_now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Whether an authentication attempt succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One parsed authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    /// Source address as it appeared in the log line. Treated as an opaque
    /// key; the tracker never interprets it.
    pub address: String,
    pub outcome: Outcome,
    pub timestamp: Timestamp,
}

/// Live stream of raw authentication log lines.
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next batch of lines. An empty batch is a valid "no data
    /// right now" answer; an error means the stream is gone for good.
    async fn next_batch(&mut self) -> Result<Vec<String>, GuardError>;
}

/// Tails the systemd journal for one syslog identifier via a `journalctl -f`
/// child process.
///
/// Keeping the journal behind a subprocess (rather than linking libsystemd)
/// keeps the daemon buildable everywhere; the intake loop only sees lines.
pub struct JournalSource {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl JournalSource {
    pub fn spawn(service: &str) -> Result<Self, GuardError> {
        let mut child = Command::new("journalctl")
            .args(["-f", "-n", "0", "-o", "cat", "-t", service])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GuardError::EventSource("journalctl stdout unavailable".into()))?;
        debug!(service, "journal tail started");
        Ok(Self { child, lines: BufReader::new(stdout).lines() })
    }
}

#[async_trait]
impl EventSource for JournalSource {
    async fn next_batch(&mut self) -> Result<Vec<String>, GuardError> {
        match self.lines.next_line().await? {
            Some(line) => Ok(vec![line]),
            None => {
                let status = self.child.wait().await?;
                Err(GuardError::EventSource(format!(
                    "journalctl exited: {status}"
                )))
            }
        }
    }
}

/// Channel-backed source for tests and piped input.
pub struct ChannelSource {
    rx: mpsc::Receiver<String>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Convenience constructor returning the feeding half alongside.
    pub fn pair(buffer: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_batch(&mut self) -> Result<Vec<String>, GuardError> {
        let first = self
            .rx
            .recv()
            .await
            .ok_or_else(|| GuardError::EventSource("event channel closed".into()))?;
        let mut batch = vec![first];
        while let Ok(line) = self.rx.try_recv() {
            batch.push(line);
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_source_drains_available_lines() {
        let (tx, mut source) = ChannelSource::pair(8);
        tx.send("one".into()).await.unwrap();
        tx.send("two".into()).await.unwrap();
        let batch = source.next_batch().await.unwrap();
        assert_eq!(batch, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn channel_source_errors_once_closed() {
        let (tx, mut source) = ChannelSource::pair(1);
        drop(tx);
        assert!(source.next_batch().await.is_err());
    }
}
