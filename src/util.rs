//! Small shared helpers.

use std::future::Future;
use std::time::Duration;

/// Poll `probe` until it yields a value or `timeout` elapses.
///
/// The probe runs once immediately, then every `interval`. All the
/// poll-sleep-recheck loops in the runner (session acquisition, confirmation
/// waiting) go through here so timeout semantics live in one place and can
/// be tested against tokio's paused clock.
pub async fn poll_until<T, F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if tokio::time::Instant::now() + interval > deadline {
            return None;
        }
        tokio::time::sleep(interval).await;
    }
}
