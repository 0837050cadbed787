//! Wall-clock sources.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" in Unix epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Reads the OS clock on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        system_now_ms()
    }
}

/// Epoch time derived from the tokio clock.
///
/// Anchors the OS clock once and advances with `tokio::time::Instant`, so
/// timer sleeps and `now_ms` always agree, including under paused test time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    anchor_epoch_ms: i64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::anchored_at(system_now_ms())
    }

    /// Anchors the clock at an explicit epoch value.
    pub fn anchored_at(epoch_ms: i64) -> Self {
        Self {
            anchor_epoch_ms: epoch_ms,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = tokio::time::Instant::now().duration_since(self.anchor);
        let elapsed_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        self.anchor_epoch_ms.saturating_add(elapsed_ms)
    }
}

fn system_now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
