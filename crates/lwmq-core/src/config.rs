// ── Runtime configuration ──

use std::time::Duration;

use crate::model::Catalog;

/// Runtime settings for a [`Shepherd`](crate::Shepherd).
///
/// Loading from files or the environment lives in `lwmq-config`; this type
/// is plain data so the core stays free of I/O.
#[derive(Debug, Clone)]
pub struct ShepherdConfig {
    /// Deadline for a regular request round trip.
    pub request_timeout: Duration,
    /// Deadline for the low-cost probe used by the sleep ladder.
    pub quick_ping_timeout: Duration,
    /// Added to a device's sleep duration before the first probe.
    pub sleep_margin: Duration,
    /// Pause between failed sleep probes.
    pub sleep_retry_interval: Duration,
    pub sleep_probe_attempts: u32,
    /// Capacity of the broadcast event channel.
    pub event_capacity: usize,
    pub catalog: Catalog,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            quick_ping_timeout: Duration::from_secs(1),
            sleep_margin: Duration::from_secs(1),
            sleep_retry_interval: Duration::from_millis(500),
            sleep_probe_attempts: 4,
            event_capacity: 256,
            catalog: Catalog::lwm2m_core(),
        }
    }
}
