//! Bounded retry with exponential backoff for external calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::ProvisionError;

/// Retry configuration for operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between retries.
    #[serde(with = "secs")]
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    #[serde(with = "secs")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Check the policy is usable.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] for zero attempts, a multiplier
    /// that is not a finite number of at least 1, or an initial delay
    /// above the maximum.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.max_attempts == 0 {
            return Err(ProvisionError::Config(
                "retry.max-attempts must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ProvisionError::Config(format!(
                "retry.backoff-multiplier must be a finite number >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ProvisionError::Config(format!(
                "retry.initial-delay ({:?}) exceeds retry.max-delay ({:?})",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_multiplier)
            .map_or(self.max_delay, |next| next.min(self.max_delay))
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Execute an async operation with retry logic.
///
/// Retryable failures (see [`ProvisionError::is_retryable`]) are retried up
/// to `config.max_attempts` times with exponential backoff. Every attempt,
/// and every backoff sleep, is bounded by `deadline`; running out of time
/// fails with [`ProvisionError::Timeout`].
///
/// # Errors
///
/// Returns the last error once attempts are exhausted, any non-retryable
/// error immediately, or a timeout.
pub async fn with_retry_async<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    deadline: Option<Instant>,
    mut f: F,
) -> Result<T, ProvisionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        let outcome = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, f())
                .await
                .map_err(|_| ProvisionError::timeout(operation_name))?,
            None => f().await,
        };

        match outcome {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Giving up"
                    );
                    return Err(e);
                }

                let resume_at = Instant::now().checked_add(delay);
                if deadline.is_some_and(|d| resume_at.map_or(true, |t| t >= d)) {
                    warn!(operation = operation_name, error = %e, "Deadline leaves no room to retry");
                    return Err(ProvisionError::timeout(operation_name));
                }

                info!(
                    "{operation_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}...",
                    config.max_attempts
                );

                tokio::time::sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert!((config.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = fast();
        let d = config.next_delay(Duration::from_millis(10));
        assert_eq!(d, Duration::from_millis(20));
        assert_eq!(config.next_delay(Duration::from_millis(30)), Duration::from_millis(40));
    }

    #[test]
    fn test_unusable_multiplier_falls_back_to_max_delay() {
        for multiplier in [-1.0, f64::NAN, f64::INFINITY, 1e300] {
            let config = RetryConfig {
                backoff_multiplier: multiplier,
                ..fast()
            };
            assert_eq!(
                config.next_delay(Duration::from_millis(10)),
                Duration::from_millis(40),
                "{multiplier}"
            );
        }
    }

    #[test]
    fn test_validate() {
        assert!(fast().validate().is_ok());
        assert!(RetryConfig::default().validate().is_ok());
        for multiplier in [-1.0, 0.5, f64::NAN, f64::INFINITY] {
            let config = RetryConfig {
                backoff_multiplier: multiplier,
                ..fast()
            };
            assert!(matches!(config.validate(), Err(ProvisionError::Config(_))), "{multiplier}");
        }
        let inverted = RetryConfig {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            ..fast()
        };
        assert!(inverted.validate().is_err());
        assert!(RetryConfig { max_attempts: 0, ..fast() }.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_multiplier_still_retries() {
        let config = RetryConfig {
            backoff_multiplier: -1.0,
            ..fast()
        };
        let calls = &AtomicU32::new(0);
        let err = with_retry_async(&config, "op", None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProvisionError::BackendUnavailable("reset".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::BackendUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = &AtomicU32::new(0);
        let result = with_retry_async(&fast(), "op", None, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProvisionError::BackendUnavailable("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let calls = &AtomicU32::new(0);
        let err = with_retry_async(&fast(), "op", None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProvisionError::BackendUnavailable("503".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::BackendUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semantic_failures_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = with_retry_async(&fast(), "op", None, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ProvisionError::AuthorizationFailed("denied".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::AuthorizationFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_bounds_a_hanging_call() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = with_retry_async(&fast(), "launch", Some(deadline), || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, ProvisionError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(5),
            ..fast()
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        let err = with_retry_async(&config, "op", Some(deadline), || async {
            Err::<(), _>(ProvisionError::BackendUnavailable("reset".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }
}
