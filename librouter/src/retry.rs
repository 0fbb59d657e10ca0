use std::time::Duration;

use log::debug;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

/// Retry `op` with exponential backoff until it succeeds or the token fires.
/// Returns `None` when cancelled.
pub async fn retry_until_cancelled<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Option<T>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial;
    let mut attempt = 0u64;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match op().await {
            Ok(value) => return Some(value),
            Err(e) => {
                attempt += 1;
                debug!("retry attempt {attempt} failed: {e}");
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = sleep(delay) => {}
        }
        delay = Duration::from_secs_f64((delay.as_secs_f64() * policy.factor).min(policy.max.as_secs_f64()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            initial: Duration::from_millis(5),
            max: Duration::from_millis(20),
            factor: 2.0,
        };

        let result = retry_until_cancelled(policy, &cancel, move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Some(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancellation_ends_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Option<()> = retry_until_cancelled(RetryPolicy::default(), &cancel, || async {
            Err::<(), _>("always")
        })
        .await;
        assert!(result.is_none());
    }
}
