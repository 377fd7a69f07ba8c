use std::time::Duration;

use crate::config::Config;

/// Backoff that grows by a fixed step per attempt: attempt 3 waits three steps.
pub struct LinearBackoff {
    step_ms: u64,
}

impl LinearBackoff {
    pub const fn new(step_ms: u64) -> Self {
        Self { step_ms }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.step_ms.saturating_mul(attempt as u64))
    }
}

impl Default for LinearBackoff {
    fn default() -> Self {
        Self::new(Config::RETRY_BACKOFF_STEP_MS)
    }
}

/// Normalize a pause requested by a remote peer.
///
/// Negative values fall back to a short fixed pause, values above the
/// ceiling are capped, zero means "no pause".
pub fn clamp_peer_pause(requested_ms: i64) -> Duration {
    let ms = if requested_ms < 0 {
        Config::NEGATIVE_PEER_PAUSE_MS
    } else {
        (requested_ms as u64).min(Config::MAX_PEER_PAUSE_MS)
    };
    Duration::from_millis(ms)
}
