//! Periodic update checks.
//!
//! [`UpdateWatcher`] wakes every `check_interval_secs` and asks the state
//! machine to check for an update. Ticks that land while a check or install
//! is in flight, or while the machine is `Failed`, are skipped; a failed
//! attempt needs an explicit retry.

use crate::update::state::{UpdateState, UpdateStateMachine};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct UpdateWatcher {
    machine: Arc<UpdateStateMachine>,
    cancel: CancellationToken,
    interval: Duration,
}

impl UpdateWatcher {
    /// Call [`run`](Self::run) to start checking.
    pub fn new(
        machine: Arc<UpdateStateMachine>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            machine,
            cancel,
            interval,
        }
    }

    /// Run until `cancel` fires. Intended to be spawned:
    ///
    /// ```rust,ignore
    /// let watcher = UpdateWatcher::new(machine, interval, cancel.child_token());
    /// tokio::spawn(watcher.run());
    /// ```
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "update watcher started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("update watcher cancelled");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let state = self.machine.state();
        if state.is_busy() || matches!(state, UpdateState::Failed(_)) {
            debug!(state = %state.kind(), "skipping scheduled update check");
            return;
        }
        match self.machine.check_for_update().await {
            Ok(Some(metadata)) => {
                info!(version = %metadata.version, "scheduled check found an update");
            }
            Ok(None) => debug!("scheduled check: up to date"),
            Err(e) => warn!(error = %e, "scheduled update check failed"),
        }
    }
}
