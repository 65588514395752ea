use std::future::Future;
use std::time::Duration;

use forge_types::{CallErrorKind, ModelCallError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Maps a provider error message onto the call-failure taxonomy.
pub fn classify_error_message(message: &str) -> CallErrorKind {
    let e = message.to_ascii_lowercase();
    if e.contains("cancelled") || e.contains("canceled") {
        return CallErrorKind::Cancelled;
    }
    if e.contains("429")
        || e.contains("rate limit")
        || e.contains("too many requests")
        || e.contains("resource_exhausted")
    {
        return CallErrorKind::RateLimited;
    }
    if e.contains("401")
        || e.contains("403")
        || e.contains("unauthorized")
        || e.contains("authentication")
        || e.contains("invalid api key")
    {
        return CallErrorKind::Auth;
    }
    if e.contains("timeout")
        || e.contains("timed out")
        || e.contains("deadline_exceeded")
        || e.contains("408")
    {
        return CallErrorKind::Timeout;
    }
    if e.contains("connection")
        || e.contains("error sending request")
        || e.contains("unavailable")
        || e.contains("500")
        || e.contains("502")
        || e.contains("503")
        || e.contains("504")
    {
        return CallErrorKind::Transport;
    }
    if e.contains("no completion content") || e.contains("error decoding") {
        return CallErrorKind::InvalidResponse;
    }
    CallErrorKind::Unknown
}

pub fn is_retryable(kind: CallErrorKind) -> bool {
    matches!(
        kind,
        CallErrorKind::RateLimited | CallErrorKind::Timeout | CallErrorKind::Transport
    )
}

fn next_retry_delay(current: Duration, config: &RetryConfig) -> Duration {
    if current >= config.max_delay {
        return config.max_delay;
    }
    let multiplier = config.backoff_multiplier.max(1.0) as f64;
    let scaled = Duration::from_secs_f64(current.as_secs_f64() * multiplier);
    scaled.min(config.max_delay)
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or the retry
/// allowance runs out. `on_retry(attempt, delay, error)` fires before each backoff
/// sleep. Both the attempt and the sleep stop early on cancellation.
pub async fn execute_with_retry<T, Op, Fut, OnRetry>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: OnRetry,
    mut operation: Op,
) -> Result<T, ModelCallError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ModelCallError>>,
    OnRetry: FnMut(u32, Duration, &ModelCallError),
{
    let mut attempt: u32 = 0;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(ModelCallError::cancelled());
        }
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ModelCallError::cancelled()),
            outcome = operation() => outcome,
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(error)
                if config.enabled
                    && attempt < config.max_retries
                    && is_retryable(error.kind) =>
            {
                attempt += 1;
                tracing::warn!(
                    attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "model call failed with retryable error; retrying"
                );
                on_retry(attempt, delay, &error);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ModelCallError::cancelled()),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = next_retry_delay(delay, config);
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_initial_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO)
    }

    #[test]
    fn classifies_common_provider_messages() {
        assert_eq!(
            classify_error_message("provider request failed with status 429 Too Many Requests"),
            CallErrorKind::RateLimited
        );
        assert_eq!(
            classify_error_message("provider authentication failed (401)"),
            CallErrorKind::Auth
        );
        assert_eq!(
            classify_error_message("operation timed out"),
            CallErrorKind::Timeout
        );
        assert_eq!(
            classify_error_message("status 503 Service Unavailable"),
            CallErrorKind::Transport
        );
        assert_eq!(classify_error_message("weird"), CallErrorKind::Unknown);
    }

    #[test]
    fn backoff_grows_until_cap() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(3));
        let second = next_retry_delay(Duration::from_secs(1), &config);
        assert_eq!(second, Duration::from_secs(2));
        assert_eq!(next_retry_delay(second, &config), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let mut retries_seen = 0;
        let result = execute_with_retry(
            &fast_config(2),
            &cancel,
            |_, _, _| retries_seen += 1,
            || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ModelCallError::new(CallErrorKind::RateLimited, "429"))
                    } else {
                        Ok("ok")
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok("ok"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(retries_seen, 2);
    }

    #[tokio::test]
    async fn does_not_retry_auth_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result: Result<(), _> = execute_with_retry(
            &fast_config(5),
            &cancel,
            |_, _, _| {},
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ModelCallError::new(CallErrorKind::Auth, "401"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, CallErrorKind::Auth);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result: Result<(), _> = execute_with_retry(
            &fast_config(2),
            &cancel,
            |_, _, _| {},
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ModelCallError::new(CallErrorKind::Transport, "503"))
                }
            },
        )
        .await;

        assert_eq!(result.unwrap_err().kind, CallErrorKind::Transport);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_secs(60))
            .with_max_delay(Duration::from_secs(60));
        let trigger = cancel.clone();
        let result: Result<(), _> = execute_with_retry(
            &config,
            &cancel,
            move |_, _, _| trigger.cancel(),
            || async { Err(ModelCallError::new(CallErrorKind::Timeout, "timed out")) },
        )
        .await;

        assert!(result.unwrap_err().is_cancelled());
    }
}
