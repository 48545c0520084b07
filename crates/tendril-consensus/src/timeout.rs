use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tendril_core::{Height, Round};
use tokio::sync::mpsc;
use tracing::debug;

use crate::round_state::RoundStep;

/// A timer for (height, round, step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: Height,
    pub round: Round,
    pub step: RoundStep,
}

/// Delivers each scheduled [`TimeoutInfo`] back to the engine once its
/// duration has passed. Stale timeouts are filtered by the engine.
pub trait TimeoutScheduler: Send + Sync {
    fn schedule_timeout(&self, ti: TimeoutInfo);
}

/// One tokio sleep per scheduled timeout.
#[derive(Debug, Clone)]
pub struct TimeoutTicker {
    tx: mpsc::UnboundedSender<TimeoutInfo>,
}

impl TimeoutTicker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimeoutInfo>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimeoutTicker { tx }, rx)
    }
}

impl TimeoutScheduler for TimeoutTicker {
    fn schedule_timeout(&self, ti: TimeoutInfo) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ti.duration).await;
            if tx.send(ti).is_err() {
                debug!("Timeout {}/{}/{} dropped, engine is gone", ti.height, ti.round, ti.step);
            }
        });
    }
}

/// Records timeouts instead of firing them; the caller decides when each
/// one expires.
#[derive(Debug, Default)]
pub struct ManualTimeouts {
    scheduled: Mutex<Vec<TimeoutInfo>>,
}

impl ManualTimeouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scheduled(&self) -> Vec<TimeoutInfo> {
        self.scheduled.lock().clone()
    }

    pub fn take(&self) -> Vec<TimeoutInfo> {
        std::mem::take(&mut *self.scheduled.lock())
    }

    pub fn last(&self) -> Option<TimeoutInfo> {
        self.scheduled.lock().last().copied()
    }
}

impl TimeoutScheduler for ManualTimeouts {
    fn schedule_timeout(&self, ti: TimeoutInfo) {
        self.scheduled.lock().push(ti);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticker_fires_after_duration() {
        let (ticker, mut rx) = TimeoutTicker::new();
        let ti = TimeoutInfo {
            duration: Duration::from_millis(500),
            height: 1,
            round: 0,
            step: RoundStep::Propose,
        };
        ticker.schedule_timeout(ti);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(rx.try_recv().is_err());

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, ti);
    }

    #[test]
    fn test_manual_timeouts_record() {
        let timeouts = ManualTimeouts::new();
        let ti = TimeoutInfo {
            duration: Duration::ZERO,
            height: 2,
            round: 1,
            step: RoundStep::NewHeight,
        };
        timeouts.schedule_timeout(ti);
        assert_eq!(timeouts.last(), Some(ti));
        assert_eq!(timeouts.take(), vec![ti]);
        assert!(timeouts.scheduled().is_empty());
    }
}
