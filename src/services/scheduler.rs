use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::connectivity::ConnectivityMonitor;
use crate::services::sync_engine::SyncEngine;

/// Periodic drain trigger. Push sync is a non-goal; a polling nudge plus the
/// enqueue/reconnect triggers keeps the queue moving.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    connectivity: ConnectivityMonitor,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        engine: Arc<SyncEngine>,
        connectivity: ConnectivityMonitor,
        interval_secs: u64,
    ) -> Self {
        Self {
            engine,
            connectivity,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Runs forever; errors inside a drain never stop the loop.
    pub async fn start(self) {
        info!("Starting auto-sync scheduler (interval: {:?})", self.interval);

        loop {
            tokio::time::sleep(self.interval).await;

            if !self.connectivity.is_online() {
                debug!("auto-sync skipped, offline");
                continue;
            }

            match self.engine.sync_now().await {
                Ok(report) => {
                    info!(
                        "Auto-sync completed - pushed: {} creates, {} updates, {} deletes | pulled: {}",
                        report.created, report.updated, report.deleted, report.pulled
                    );
                }
                Err(e) => {
                    tracing::warn!("Auto-sync failed: {:?}", e);
                }
            }
        }
    }
}
