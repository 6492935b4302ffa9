//! Test utilities for async runner tests.
//!
//! Provides retry-until-timeout helpers so tests wait for supervisor and
//! server state changes instead of sleeping arbitrary amounts.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Assert that an async condition eventually succeeds within a timeout.
///
/// Retries `f` at `interval` until it returns `Ok` or `timeout` elapses,
/// then panics with the description and the last error.
pub async fn assert_eventually<F, Fut, T, E>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    panic!(
                        "Timeout waiting for {}\n\
                         Duration: {:?}\n\
                         Attempts: {}\n\
                         Last error: {}",
                        desc, elapsed, attempt, e
                    );
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}

/// Variant of [`assert_eventually`] for a plain boolean condition.
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut f: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        if f().await {
            return;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {}\n\
                 Duration: {:?}\n\
                 Attempts: {}\n\
                 Condition never became true",
                desc, elapsed, attempt
            );
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_immediately() {
        let value = assert_eventually(
            "immediate success",
            Duration::from_secs(1),
            Duration::from_millis(20),
            || async { Ok::<_, &str>(7) },
        )
        .await;
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let counter = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&counter);
        assert_eventually_bool(
            "counter reaches 3",
            Duration::from_secs(2),
            Duration::from_millis(10),
            move || {
                let counter = Arc::clone(&shared);
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 2 }
            },
        )
        .await;
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    #[should_panic(expected = "Timeout waiting for never succeeds")]
    async fn panics_on_timeout() {
        assert_eventually(
            "never succeeds",
            Duration::from_millis(100),
            Duration::from_millis(20),
            || async { Err::<(), _>("still failing") },
        )
        .await;
    }
}
