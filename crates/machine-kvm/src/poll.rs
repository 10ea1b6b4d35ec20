//! Fixed-interval polling: the hypervisor pushes no events, so boot and
//! shutdown completion are observed by sleeping and checking again.

use std::future::Future;
use std::time::Duration;

/// How often and how many times to check a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep before each check
    pub interval: Duration,
    /// Number of checks before giving up
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Waiting for a booted guest to obtain an IP address.
    pub const BOOT: PollPolicy = PollPolicy::new(Duration::from_secs(1), 350);

    /// Waiting for a graceful shutdown to complete.
    pub const SHUTDOWN: PollPolicy = PollPolicy::new(Duration::from_secs(1), 90);

    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Upper bound of the time spent polling.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Sleep-then-check until `probe` yields a value or the attempts run out.
///
/// `probe` receives the 0-based attempt number. Returns the first `Some`
/// value, or `None` once `policy.max_attempts` checks came back empty.
pub async fn poll_until<T, F, Fut>(policy: PollPolicy, mut probe: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 0..policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        if let Some(value) = probe(attempt).await {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    #[test]
    fn test_budgets() {
        assert_eq!(PollPolicy::BOOT.budget(), Duration::from_secs(350));
        assert_eq!(PollPolicy::SHUTDOWN.budget(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_hit() {
        let start = Instant::now();
        let calls = Cell::new(0);
        let result = poll_until(PollPolicy::SHUTDOWN, |attempt| {
            calls.set(calls.get() + 1);
            async move { (attempt == 4).then_some(attempt) }
        })
        .await;

        assert_eq!(result, Some(4));
        assert_eq!(calls.get(), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let start = Instant::now();
        let calls = Cell::new(0);
        let result: Option<()> = poll_until(PollPolicy::new(Duration::from_secs(2), 3), |_| {
            calls.set(calls.get() + 1);
            async { None }
        })
        .await;

        assert_eq!(result, None);
        assert_eq!(calls.get(), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }
}
