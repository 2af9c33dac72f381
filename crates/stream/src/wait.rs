//! Bounded polling helpers.

use std::time::Duration;

use crate::error::{Error, Result};

/// Interval between two checks of the condition.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held. Never fails.
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: FnMut() -> bool,
{
    poll(timeout, condition).await.is_some()
}

/// Poll `condition` until it holds, failing once `timeout` elapses.
///
/// Returns how long the wait took.
///
/// # Errors
/// Returns `Error::ConditionTimeout` with `message`, or a generic one, if the
/// condition never held.
pub async fn wait_at_most<F>(timeout: Duration, condition: F, message: Option<&str>) -> Result<Duration>
where
    F: FnMut() -> bool,
{
    poll(timeout, condition).await.ok_or_else(|| {
        let detail = message.unwrap_or("condition never got true");
        Error::condition_timeout(
            timeout,
            format!("Waited {} second(s), {detail}", timeout.as_secs()),
        )
    })
}

async fn poll<F>(timeout: Duration, mut condition: F) -> Option<Duration>
where
    F: FnMut() -> bool,
{
    if condition() {
        return Some(Duration::ZERO);
    }
    let mut waited = Duration::ZERO;
    while waited < timeout {
        let step = POLL_INTERVAL.min(timeout.saturating_sub(waited));
        tokio::time::sleep(step).await;
        waited = waited.saturating_add(step);
        if condition() {
            return Some(waited);
        }
    }
    None
}
