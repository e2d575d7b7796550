//! Monotonic time and cancellable delays (C1), behind a trait so the
//! dispatcher and pool can be tested without waiting out real backoffs.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Outcome of a cancellable sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = SleepOutcome> + Send + '_>>;
}

/// Production clock: delegates to `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = SleepOutcome> + Send + '_>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => SleepOutcome::Cancelled,
                _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_elapses_without_cancellation() {
        let clock = SystemClock;
        let cancel = CancellationToken::new();
        let outcome = clock.sleep(Duration::from_millis(10), &cancel).await;
        assert_eq!(outcome, SleepOutcome::Elapsed);
    }

    #[tokio::test]
    async fn sleep_cancels_immediately_when_token_already_cancelled() {
        let clock = SystemClock;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = clock.sleep(Duration::from_secs(30), &cancel).await;
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }
}
