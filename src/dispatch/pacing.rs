//! Global send pacing.
//!
//! One pacer is shared by every dispatch worker in a batch, so the minimum
//! spacing holds across organizations, not just within one. The spacing is
//! jittered per send to avoid a fixed-interval burst signature.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::DispatchError;

/// Jittered minimum-spacing pacer.
#[derive(Debug)]
pub struct SendPacer {
    interval: Duration,
    jitter: Duration,
    last_send: Mutex<Option<Instant>>,
}

impl SendPacer {
    pub fn new(interval: Duration, jitter: Duration) -> Result<Self, DispatchError> {
        if interval.is_zero() && jitter.is_zero() {
            return Err(DispatchError::InvalidPacing {
                interval,
                reason: "interval and jitter are both zero".into(),
            });
        }
        Ok(Self {
            interval,
            jitter,
            last_send: Mutex::new(None),
        })
    }

    /// A pacer that never waits (tests, dry runs).
    pub fn unpaced() -> Self {
        Self {
            interval: Duration::ZERO,
            jitter: Duration::ZERO,
            last_send: Mutex::new(None),
        }
    }

    /// Wait until the next send slot, then claim it. The first call in a
    /// process does not wait.
    pub async fn pace(&self) {
        let spacing = self.jittered_spacing();
        let mut last = self.last_send.lock().await;
        if let Some(prev) = *last {
            let due = prev + spacing;
            let now = Instant::now();
            if due > now {
                tokio::time::sleep(due - now).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn jittered_spacing(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.interval;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.interval + Duration::from_millis(extra_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_spacing() {
        let err = SendPacer::new(Duration::ZERO, Duration::ZERO).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidPacing { .. }));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let pacer =
            SendPacer::new(Duration::from_millis(100), Duration::from_millis(50)).unwrap();
        for _ in 0..100 {
            let spacing = pacer.jittered_spacing();
            assert!(spacing >= Duration::from_millis(100));
            assert!(spacing <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn first_send_does_not_wait() {
        let pacer = SendPacer::new(Duration::from_secs(60), Duration::ZERO).unwrap();
        let start = Instant::now();
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn second_send_waits_for_the_interval() {
        tokio::time::pause();
        let pacer = SendPacer::new(Duration::from_secs(30), Duration::ZERO).unwrap();

        pacer.pace().await;
        let before = Instant::now();
        pacer.pace().await;
        assert!(before.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn unpaced_never_waits() {
        let pacer = SendPacer::unpaced();
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
