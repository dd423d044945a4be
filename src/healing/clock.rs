//! Time source
//!
//! Execution timing, retries, timeouts and cache expiry all go through a
//! `Clock` so they can be driven without wall-clock delays.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait::async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait::async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Clock that follows the tokio timer from a fixed origin.
///
/// Under a paused runtime (`start_paused = true`) sleeps complete as soon as
/// every task is idle, so timeouts resolve instantly and deterministically.
/// `advance` jumps wall time forward without sleeping.
#[derive(Debug)]
pub struct ManualClock {
    origin: DateTime<Utc>,
    started: Instant,
    offset: Mutex<chrono::Duration>,
}

impl ManualClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            started: Instant::now(),
            offset: Mutex::new(chrono::Duration::zero()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock();
        *offset += to_chrono(duration);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait::async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.origin + to_chrono(self.started.elapsed()) + *self.offset.lock()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Convert for chrono arithmetic, saturating on overflow
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Run `fut` unless `limit` elapses on `clock` first.
///
/// The future is always polled before the timer, so work that is already
/// complete is never reported as timed out.
pub async fn within<F>(clock: &dyn Clock, limit: Duration, fut: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        out = fut => Some(out),
        _ = clock.sleep(limit) => None,
    }
}
