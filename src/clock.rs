//! Time source and sleep abstraction.
//!
//! Every pause the control loop takes (supervisor backoff, resync grace,
//! launch backoff) goes through a [`Clock`], so tests can drive the loop
//! without waiting in real time.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[async_trait]
pub trait Clock: Send + Sync {
    /// Seconds since the UNIX epoch, with sub-second precision.
    fn now(&self) -> f64;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
