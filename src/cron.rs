use crate::registry::TaskRegistry;
use std::sync::Arc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

/// Start the fast-view cleanup task.
/// - Runs every `period`
/// - Drops terminal tasks whose grace window has passed (they stay in the durable store)
pub async fn start_eviction_task(registry: Arc<TaskRegistry>, period: Duration) {
    debug!("[Evict] Starting fast-view cleanup every {:?}", period);

    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let evicted = registry.evict_expired();
        if evicted > 0 {
            debug!("[Evict] Dropped {} finished task(s) from the fast view", evicted);
        }
    }
}
