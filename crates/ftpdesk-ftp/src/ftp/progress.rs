//! Progress throttling and fire-and-forget delivery.

use crate::ftp::types::ProgressSnapshot;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Monotonic-clock rate limiter: the first call passes, later calls pass
/// once `interval` has elapsed since the last one that passed.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn should_emit(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Optional progress channel. Emission never blocks: when the observer
/// lags and the channel is full, the snapshot is dropped.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressSnapshot>>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressSnapshot>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Returns whether the snapshot was queued.
    pub fn emit(&self, snapshot: ProgressSnapshot) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(snapshot) {
            Ok(()) => true,
            Err(TrySendError::Full(s)) => {
                log::trace!("progress for {} dropped: observer lagging", s.transfer_id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}
