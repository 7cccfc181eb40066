//! Read-modify-write retry for optimistic concurrency conflicts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub steps: u32,
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { steps: 5, initial: Duration::from_millis(10), factor: 5, max: Duration::from_secs(2) }
    }
}

impl Backoff {
    pub fn with_steps(steps: u32) -> Self { Self { steps: steps.max(1), ..Self::default() } }

    /// Delay before attempt `n + 1` (n starts at 1).
    pub fn delay(&self, n: u32) -> Duration {
        let mut d = self.initial;
        for _ in 1..n {
            d = d.saturating_mul(self.factor);
            if d >= self.max { return self.max; }
        }
        d.min(self.max)
    }
}

/// Errors that can tell a lost optimistic-concurrency race apart from other failures.
pub trait Retryable {
    fn is_conflict(&self) -> bool;
}

/// Run `op` (a full read-modify-write cycle) until it succeeds, fails with a
/// non-conflict error, or the backoff is exhausted. The last error is returned.
pub async fn with_optimistic_retry<T, E, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < backoff.steps => {
                let wait = backoff.delay(attempt);
                debug!(attempt, wait_ms = wait.as_millis() as u64, "conflict; retrying read-modify-write");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum E { Conflict, Fatal }
    impl Retryable for E { fn is_conflict(&self) -> bool { matches!(self, E::Conflict) } }

    fn quick(steps: u32) -> Backoff {
        Backoff { steps, initial: Duration::from_millis(1), factor: 2, max: Duration::from_millis(4) }
    }

    #[test]
    fn delay_grows_and_caps() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(2), Duration::from_millis(50));
        assert_eq!(b.delay(4), Duration::from_millis(1250));
        assert_eq!(b.delay(9), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn retries_conflicts_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<u32, E> = with_optimistic_retry(&quick(5), || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 { Err(E::Conflict) } else { Ok(n) }
        }).await;
        assert_eq!(out, Ok(2));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_steps_and_never_retries_fatal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), E> = with_optimistic_retry(&quick(3), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(E::Conflict)
        }).await;
        assert_eq!(out, Err(E::Conflict));
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let out: Result<(), E> = with_optimistic_retry(&quick(3), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(E::Fatal)
        }).await;
        assert_eq!(out, Err(E::Fatal));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
