//! Periodic reclamation of abandoned sessions.

use super::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Sweep the registry every `interval`, force-killing sessions that have
/// been unbound and inactive for longer than `threshold`.
///
/// The first sweep runs one full interval after start.
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    threshold: Duration,
) -> JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        threshold_secs = threshold.as_secs(),
        "idle reaper started"
    );
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(threshold).await;
            debug!(reaped = reaped.len(), "idle sweep finished");
        }
    })
}
