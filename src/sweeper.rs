//! Background cleanup scheduling.
//!
//! The actual sweep logic lives on [`AttemptTracker::sweep`] so tests can
//! drive it synchronously with virtual time; this module only owns the tick
//! loop and its shutdown handling.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::event::unix_now;
use crate::tracker::AttemptTracker;

pub struct CleanupScheduler {
    tracker: Arc<AttemptTracker>,
    period: Duration,
}

impl CleanupScheduler {
    pub fn new(tracker: Arc<AttemptTracker>, period: Duration) -> Self {
        Self { tracker, period }
    }

    /// Sweep on a fixed interval until the shutdown signal fires.
    ///
    /// The wait between sweeps is a `select!` over the ticker and the
    /// broadcast receiver, so shutdown interrupts the sleep instead of
    /// waiting out a full period, and no external call is started after the
    /// signal.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; skip the startup tick so the first
        // sweep happens one full period after launch.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = self.tracker.sweep(unix_now()).await;
                    debug!(
                        expired = stats.expired,
                        unblocked = stats.unblocked,
                        idle_removed = stats.idle_removed,
                        tracked = self.tracker.tracked(),
                        "cleanup sweep finished"
                    );
                }
                _ = shutdown.recv() => {
                    info!("cleanup scheduler stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::firewall::{BlocklistController, RecordingController};
    use crate::persistence::NullAudit;
    use tokio::time::timeout;

    fn tracker() -> Arc<AttemptTracker> {
        Arc::new(AttemptTracker::new(
            &GuardConfig::default(),
            Arc::new(RecordingController::new()) as Arc<dyn BlocklistController>,
            Arc::new(NullAudit),
        ))
    }

    #[tokio::test]
    async fn stops_promptly_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        // Period far longer than the test; only the signal can end the loop.
        let scheduler = CleanupScheduler::new(tracker(), Duration::from_secs(3600));
        let task = tokio::spawn(scheduler.run(rx));
        tx.send(()).expect("receiver alive");
        timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler must exit promptly")
            .expect("task must not panic");
    }

    #[tokio::test]
    async fn ticks_trigger_sweeps() {
        tokio::time::pause();
        let tracker = tracker();
        tracker.record_failure("10.0.0.1", 0).await;
        assert_eq!(tracker.tracked(), 1);

        let (tx, rx) = broadcast::channel(1);
        let scheduler = CleanupScheduler::new(Arc::clone(&tracker), Duration::from_secs(60));
        let task = tokio::spawn(scheduler.run(rx));

        // Let several virtual minutes elapse; the record's wall-clock idle
        // retention (unix_now-based) has long passed its timestamp 0.
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(61)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.tracked(), 0, "sweep should have dropped the idle record");

        tx.send(()).expect("receiver alive");
        task.await.expect("task must not panic");
    }
}
