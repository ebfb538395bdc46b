//! Polling helpers for async assertions.

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Interval between condition checks.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. Works under paused Tokio time: each poll sleeps, which
/// lets the runtime auto-advance the clock.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// use dnsfleet_test_utils::{RecordingSink, assert_eventually};
///
/// # async fn example(sink: RecordingSink) {
/// assert!(assert_eventually(Duration::from_secs(1), || sink.state_count() >= 2).await);
/// # }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    eventually_some(timeout, || condition().then_some(())).await.is_some()
}

/// Polls `poll` until it yields a value or `timeout` elapses.
pub async fn eventually_some<F, T>(timeout: Duration, poll: F) -> Option<T>
where
    F: Fn() -> Option<T>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = poll() {
            return Some(value);
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep(POLL_INTERVAL).await;
    }
}
