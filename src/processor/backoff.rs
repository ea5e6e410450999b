//! Poll delay: exponential backoff with a jitter band.

use crate::config::PollingConfig;
use rand::Rng;
use std::time::Duration;

/// Delay before poll number `poll_count + 1`, with random jitter.
pub fn poll_delay(config: &PollingConfig, poll_count: u32) -> Duration {
    let spread = config.jitter.clamp(0.0, 1.0);
    let unit = if spread > 0.0 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    } else {
        0.0
    };
    poll_delay_with(config, poll_count, unit)
}

/// Deterministic form of [`poll_delay`]: `unit` in `[-1, 1]` picks the point
/// inside the jitter band.
pub fn poll_delay_with(config: &PollingConfig, poll_count: u32, unit: f64) -> Duration {
    let factor = 2u64.saturating_pow(poll_count);
    let base = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_cap_ms);
    let spread = config.jitter.clamp(0.0, 1.0);
    let jittered = base as f64 * (1.0 + spread * unit.clamp(-1.0, 1.0));
    Duration::from_millis(jittered.round().max(0.0) as u64)
}

/// Delay before rowset probe attempt `attempt + 1`.
pub fn rowset_probe_delay(config: &PollingConfig, attempt: u32) -> Duration {
    config.rowset_ready_base_delay().saturating_mul(attempt.max(1))
}
