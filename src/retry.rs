// Exponential backoff with jitter for connection establishment

use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000, // 30 seconds
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Calculate delay for nth retry with exponential backoff + jitter
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);

        // Cap at max_delay
        let capped_delay = base_delay.min(self.config.max_delay_ms as f64);

        // Add jitter to prevent thundering herd
        let jitter_range = capped_delay * self.config.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Execute operation with retry logic. `is_retryable` decides whether a
    /// failure is worth another attempt; the last error is returned when
    /// attempts run out.
    pub async fn execute_with_retry<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_retryable: P,
        operation_name: &str,
    ) -> std::result::Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = self.calculate_delay(attempt - 1);
                warn!(
                    "Retry attempt {}/{} for {} after {:?}",
                    attempt, self.config.max_retries, operation_name, delay
                );
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            "Operation {} succeeded on retry attempt {}/{}",
                            operation_name, attempt, self.config.max_retries
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !is_retryable(&e) {
                        warn!("Non-retryable error for {}: {}", operation_name, e);
                        return Err(e);
                    }

                    warn!(
                        "Attempt {}/{} failed for {}: {}",
                        attempt + 1,
                        self.config.max_retries + 1,
                        operation_name,
                        e
                    );

                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0, // No jitter for predictable testing
        };

        let strategy = RetryStrategy::new(config);

        assert_eq!(strategy.calculate_delay(0).as_millis(), 1000);
        assert_eq!(strategy.calculate_delay(1).as_millis(), 2000);
        assert_eq!(strategy.calculate_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        let strategy = RetryStrategy::new(config);

        // Even with high retry count, delay should cap at max_delay
        assert!(strategy.calculate_delay(10).as_millis() <= 5000);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let config = RetryConfig {
            max_retries: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        };
        let strategy = RetryStrategy::new(config);
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = strategy
            .execute_with_retry(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("connection refused".to_string())
                },
                |_| true,
                "test-op",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let strategy = RetryStrategy::with_defaults();
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = strategy
            .execute_with_retry(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("bad auth".to_string())
                },
                |e| !e.contains("auth"),
                "test-op",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
