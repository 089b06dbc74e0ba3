//! Periodic status reconciliation
//!
//! The event stream is best-effort and can miss an `exit` across a
//! reconnect. While the tracker believes a process is running, the
//! reconciler asks the server every `interval` and folds the answer in, so a
//! stale Running view lasts at most `interval` plus one request timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::api::ProcessApi;
use crate::state::{ProcessAction, ProcessState};
use crate::tracker::ProcessTracker;

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

pub struct Reconciler {
    api: Arc<dyn ProcessApi>,
    tracker: Arc<ProcessTracker>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(api: Arc<dyn ProcessApi>, tracker: Arc<ProcessTracker>) -> Self {
        Self {
            api,
            tracker,
            interval: DEFAULT_RECONCILE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Check the tracked process once. Returns whether the state changed.
    pub async fn reconcile_once(&self) -> bool {
        let id = match self.tracker.state().as_ref() {
            ProcessState::Running { id, .. } => id.clone(),
            _ => return false,
        };

        match self.api.status(&id).await {
            Ok(status) => {
                debug!("Reconciled process {}: {:?}", id, status);
                self.tracker.dispatch(ProcessAction::Reconcile { id, status })
            }
            Err(e) => {
                warn!("Failed to reconcile process {}: {}", id, e);
                false
            }
        }
    }

    pub async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.reconcile_once().await;
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
