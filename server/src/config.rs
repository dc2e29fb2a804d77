//! Registry tuning knobs, loaded from environment variables.

use std::time::Duration;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_REAP_SECS: u64 = 30;
const DEFAULT_STALE_SECS: u64 = 60;
const DEFAULT_SINK_CAPACITY: usize = 256;

/// Parse an environment variable, falling back to a default on absence or
/// parse failure.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Timers and channel sizing for the connection registry.
#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    /// Interval between liveness broadcasts to every connection.
    pub heartbeat_interval: Duration,
    /// Interval between stale-connection sweeps.
    pub reap_interval: Duration,
    /// Age past which an unrefreshed connection is evicted.
    pub stale_after: Duration,
    /// Bounded capacity of each connection's outbound event queue.
    pub sink_capacity: usize,
}

impl RegistryConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(env_parse("SYNC_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS)),
            reap_interval: Duration::from_secs(env_parse("SYNC_REAP_SECS", DEFAULT_REAP_SECS)),
            stale_after: Duration::from_secs(env_parse("SYNC_STALE_SECS", DEFAULT_STALE_SECS)),
            sink_capacity: env_parse("SYNC_SINK_CAPACITY", DEFAULT_SINK_CAPACITY),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_SECS),
            stale_after: Duration::from_secs(DEFAULT_STALE_SECS),
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }
}
