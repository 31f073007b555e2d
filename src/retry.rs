use std::time::Duration;
use tokio::time::sleep;

/// Bounded exponential backoff used around batch flushes and register writes
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, retries: u32) -> Self {
        Self {
            initial_delay_ms: initial_ms,
            max_delay_ms: max_ms,
            max_retries: retries,
            current_attempt: 0,
        }
    }

    /// Delay for the upcoming attempt, or `None` once the budget is spent
    pub fn next_delay(&self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        let factor = 2_u64.saturating_pow(self.current_attempt);
        let delay = std::cmp::min(self.initial_delay_ms.saturating_mul(factor), self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }

    /// Consumes one attempt and returns its delay
    fn advance(&mut self) -> Result<Duration, MaxRetriesExceeded> {
        let delay = self.next_delay().ok_or(MaxRetriesExceeded)?;

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        self.current_attempt += 1;
        Ok(delay)
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.advance()?;
        sleep(delay).await;
        Ok(())
    }

    /// Same budget as `sleep`, for callers outside the runtime
    pub fn sleep_blocking(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.advance()?;
        std::thread::sleep(delay);
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(10, 35, 5);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
        backoff.current_attempt = 1;
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(20)));
        backoff.current_attempt = 2;
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(35)));
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let mut backoff = ExponentialBackoff::new(1, 1, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_err());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert!(backoff.sleep().await.is_ok());
    }

    #[test]
    fn test_blocking_sleep_shares_budget() {
        let mut backoff = ExponentialBackoff::new(2, 4, 2);
        let started = std::time::Instant::now();
        assert!(backoff.sleep_blocking().is_ok());
        assert!(backoff.sleep_blocking().is_ok());
        assert!(backoff.sleep_blocking().is_err());
        assert!(started.elapsed() >= Duration::from_millis(6));
    }
}
