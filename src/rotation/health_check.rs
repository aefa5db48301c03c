use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::driver::RotationDriver;
use super::state::{short_id, KeyStatus};

/// Periodically verify every non-tombstone key
///
/// Results are folded in through [`RotationDriver::refresh_health`], which discards
/// samples older than the entry's latest authoritative stamp.
pub fn spawn_health_checker(driver: Arc<RotationDriver>, period: Duration) -> JoinHandle<()> {
    info!(interval_secs = period.as_secs(), "Starting background key health checks");

    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; skip it so startup is not delayed by checks
        tick.tick().await;

        loop {
            tick.tick().await;

            let key_ids: Vec<String> = match driver.store().read_state().await {
                Ok(state) => state
                    .keys
                    .iter()
                    .filter(|(_, entry)| entry.status != KeyStatus::Tombstone)
                    .map(|(id, _)| id.clone())
                    .collect(),
                Err(e) => {
                    warn!("Health check skipped, rotation state unreadable: {}", e);
                    continue;
                }
            };

            for key_id in key_ids {
                match driver.refresh_health(&key_id).await {
                    Ok(report) => debug!(
                        key_id = %short_id(&key_id),
                        outcome = ?report.outcome,
                        "Health check complete"
                    ),
                    Err(e) => warn!(key_id = %short_id(&key_id), "Health check failed: {}", e),
                }
            }
        }
    })
}
