//! Pacing of retry and health-poll waits.
//!
//! Every computed wait in the crate is realized through one [`Pacer`]: the
//! engine plans a retry delay from its [`Backoff`]/[`Jitter`] pair and the
//! pacer waits it out; the startup health poller paces its fixed interval
//! the same way. Tests swap the timer for a skipping or recording mode, so
//! backoff-sensitive assertions run without real delays.

use crate::backoff::Backoff;
use crate::jitter::Jitter;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Realizes computed waits. Cheap to clone; clones of a recording pacer
/// share one log.
#[derive(Clone)]
pub struct Pacer {
    mode: Mode,
}

#[derive(Clone)]
enum Mode {
    Timer,
    Skip,
    Record(Arc<Mutex<Vec<Duration>>>),
}

impl Pacer {
    /// Production pacing through the tokio timer.
    pub fn timer() -> Self {
        Self { mode: Mode::Timer }
    }

    /// Test pacing: every pause returns immediately.
    pub fn skip() -> Self {
        Self { mode: Mode::Skip }
    }

    /// Test pacing: pauses return immediately and land on the returned
    /// [`WaitLog`] in request order.
    pub fn recording() -> (Self, WaitLog) {
        let waits = Arc::new(Mutex::new(Vec::new()));
        (Self { mode: Mode::Record(waits.clone()) }, WaitLog { waits })
    }

    /// The wait before the next attempt, after `failures` failed ones:
    /// capped exponential growth, then jitter.
    pub fn plan(&self, backoff: &Backoff, jitter: Jitter, failures: u32) -> Duration {
        jitter.apply(backoff.delay(failures))
    }

    /// Wait out `delay` according to the pacing mode.
    pub async fn pause(&self, delay: Duration) {
        match &self.mode {
            Mode::Timer => tokio::time::sleep(delay).await,
            Mode::Skip => {}
            Mode::Record(waits) => {
                waits.lock().unwrap_or_else(|p| p.into_inner()).push(delay);
            }
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::timer()
    }
}

impl fmt::Debug for Pacer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Mode::Timer => f.write_str("Pacer::Timer"),
            Mode::Skip => f.write_str("Pacer::Skip"),
            Mode::Record(_) => f.write_str("Pacer::Record"),
        }
    }
}

/// Waits recorded by a [`Pacer::recording`] pacer.
#[derive(Debug, Clone)]
pub struct WaitLog {
    waits: Arc<Mutex<Vec<Duration>>>,
}

impl WaitLog {
    /// Snapshot of all recorded waits, in request order.
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.waits.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn skip_returns_immediately() {
        let start = std::time::Instant::now();
        Pacer::skip().pause(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn recording_logs_in_order_without_waiting() {
        let (pacer, log) = Pacer::recording();
        pacer.pause(Duration::from_millis(10)).await;
        pacer.pause(Duration::from_millis(20)).await;
        assert_eq!(log.waits(), vec![Duration::from_millis(10), Duration::from_millis(20)]);

        log.clear();
        assert!(log.waits().is_empty());
    }

    #[tokio::test]
    async fn clones_share_the_log() {
        let (pacer, log) = Pacer::recording();
        pacer.clone().pause(Duration::from_millis(5)).await;
        assert_eq!(log.waits(), vec![Duration::from_millis(5)]);
    }

    #[test]
    fn plan_applies_backoff_then_jitter() {
        let pacer = Pacer::skip();
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(25));
        assert_eq!(pacer.plan(&backoff, Jitter::None, 1), Duration::from_millis(10));
        assert_eq!(pacer.plan(&backoff, Jitter::None, 2), Duration::from_millis(20));
        // Growth capped at max-backoff.
        assert_eq!(pacer.plan(&backoff, Jitter::None, 3), Duration::from_millis(25));

        for _ in 0..50 {
            let jittered = pacer.plan(&backoff, Jitter::Halved, 2);
            assert!(jittered >= Duration::from_millis(10));
            assert!(jittered <= Duration::from_millis(20));
        }
    }

    #[tokio::test]
    async fn timer_actually_waits() {
        let start = std::time::Instant::now();
        Pacer::timer().pause(Duration::from_millis(50)).await;
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
