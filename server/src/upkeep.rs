//! Background upkeep — liveness heartbeat and stale-connection reaper.
//!
//! DESIGN
//! ======
//! Two independent interval tasks spanning every owner session. The
//! heartbeat refreshes `last_seen` through its successful writes, so a
//! healthy connection is never reaped; only a sink that keeps failing
//! silently (a half-closed socket the transport never reported) ages past
//! the stale window and is swept out.

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::registry::Registry;

/// Spawn the heartbeat and reaper tasks for a registry. The handles are
/// stored by the registry and aborted by [`Registry::shutdown`].
pub(crate) fn spawn_upkeep_tasks(registry: Registry) -> Vec<JoinHandle<()>> {
    let config = registry.config();
    info!(
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        reap_secs = config.reap_interval.as_secs(),
        stale_secs = config.stale_after.as_secs(),
        "registry upkeep configured"
    );

    let heartbeat = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.heartbeat_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; the first real probe
            // waits one full period.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                registry.broadcast_heartbeat().await;
            }
        })
    };

    let reaper = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.reap_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reaped = registry.reap_stale().await;
                if reaped > 0 {
                    debug!(reaped, "reaped stale connections");
                }
            }
        })
    };

    vec![heartbeat, reaper]
}

#[cfg(test)]
#[path = "upkeep_test.rs"]
mod tests;
