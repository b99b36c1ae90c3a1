use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::services::sync_service::SyncService;
use crate::sync::SyncSession;

/// Runs a sync cycle for one session on a fixed interval.
pub struct SyncScheduler {
    service: Arc<SyncService>,
    session: Arc<SyncSession>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(service: Arc<SyncService>, session: Arc<SyncSession>, interval_secs: u64) -> Self {
        Self {
            service,
            session,
            interval: Duration::from_secs(interval_secs),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Loops forever. A failed cycle is logged by the service and the loop
    /// simply waits for the next tick.
    pub async fn start(self) {
        info!(
            user_id = %self.session.user_id(),
            "Starting auto-sync scheduler (interval: {:?})",
            self.interval
        );

        loop {
            tokio::time::sleep(self.interval).await;
            self.service.sync(&self.session).await;
        }
    }
}
