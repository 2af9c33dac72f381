//! Publish confirmations and the counting rendezvous used to await them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Error;
use crate::types::{Offset, PublishingId};

/// Outcome code carried by a [`ConfirmationStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfirmationCode {
    /// Stored at a new offset.
    Ok,
    /// Already stored under the same producer name and publishing id.
    Deduplicated,
    StreamNotFound,
    /// The broker could not be reached.
    Unavailable,
    /// No answer within the producer's confirm timeout.
    Timeout,
    /// The producer closed before the record was appended.
    ProducerClosed,
    /// Any other refusal from the broker.
    Rejected,
}

impl ConfirmationCode {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Deduplicated)
    }
}

impl From<&Error> for ConfirmationCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::StreamNotFound { .. } => Self::StreamNotFound,
            Error::Unavailable { .. } => Self::Unavailable,
            Error::ProducerClosed { .. } => Self::ProducerClosed,
            _ => Self::Rejected,
        }
    }
}

impl fmt::Display for ConfirmationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::Deduplicated => "deduplicated",
            Self::StreamNotFound => "stream not found",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::ProducerClosed => "producer closed",
            Self::Rejected => "rejected",
        };
        f.write_str(text)
    }
}

/// Asynchronous outcome of one submitted record.
///
/// Correlated with its submission by the callback it was delivered to, never
/// by publishing id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationStatus {
    publishing_id: Option<PublishingId>,
    offset: Option<Offset>,
    code: ConfirmationCode,
}

impl ConfirmationStatus {
    /// The record was stored at `offset`.
    #[must_use]
    pub const fn stored(publishing_id: Option<PublishingId>, offset: Offset) -> Self {
        Self {
            publishing_id,
            offset: Some(offset),
            code: ConfirmationCode::Ok,
        }
    }

    /// The broker already held this publishing id for the producer.
    #[must_use]
    pub const fn deduplicated(publishing_id: Option<PublishingId>) -> Self {
        Self {
            publishing_id,
            offset: None,
            code: ConfirmationCode::Deduplicated,
        }
    }

    #[must_use]
    pub const fn failed(publishing_id: Option<PublishingId>, code: ConfirmationCode) -> Self {
        Self {
            publishing_id,
            offset: None,
            code,
        }
    }

    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        self.code.is_success()
    }

    #[must_use]
    pub const fn code(&self) -> ConfirmationCode {
        self.code
    }

    /// Offset assigned to the record, `None` unless it was newly stored.
    #[must_use]
    pub const fn offset(&self) -> Option<Offset> {
        self.offset
    }

    #[must_use]
    pub const fn publishing_id(&self) -> Option<PublishingId> {
        self.publishing_id
    }
}

/// Countdown of outstanding confirmations.
///
/// Carries no record identity, only a count. Safe to decrement from any
/// number of confirmation callbacks concurrently.
///
/// ```
/// # async fn example() {
/// use std::sync::Arc;
/// use std::time::Duration;
/// use rill_stream::ConfirmationTracker;
///
/// let tracker = Arc::new(ConfirmationTracker::expecting(2));
/// tracker.on_confirm();
/// tracker.on_confirm();
/// assert!(tracker.await_all(Duration::from_secs(1)).await);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ConfirmationTracker {
    remaining: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
    notify: Notify,
}

impl ConfirmationTracker {
    /// Create a tracker with nothing outstanding.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker waiting for `n` confirmations.
    #[must_use]
    pub fn expecting(n: u64) -> Self {
        let tracker = Self::new();
        tracker.expect(n);
        tracker
    }

    /// Reset the countdown to `n`.
    pub fn expect(&self, n: u64) {
        self.remaining.store(n, Ordering::Release);
        if n == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Count one confirmation, whatever its outcome.
    pub fn on_confirm(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.notify.notify_waiters();
        }
    }

    /// Count one confirmation and tally whether it succeeded.
    pub fn record(&self, status: &ConfirmationStatus) {
        if status.is_confirmed() {
            self.confirmed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.on_confirm();
    }

    /// A callback suitable for `Producer::send` that records the status here.
    pub fn callback(self: &Arc<Self>) -> impl FnOnce(ConfirmationStatus) + Send + use<> {
        let tracker = Arc::clone(self);
        move |status| tracker.record(&status)
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Confirmations that succeeded, as seen through [`record`](Self::record).
    #[must_use]
    pub fn confirmed_count(&self) -> u64 {
        self.confirmed.load(Ordering::Relaxed)
    }

    /// Confirmations that failed, as seen through [`record`](Self::record).
    #[must_use]
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Wait until the countdown reaches zero or `timeout` elapses.
    ///
    /// Returns whether the countdown completed. A timeout is not an error.
    pub async fn await_all(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.remaining() == 0 {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.remaining() == 0;
                    }
                }
                None => notified.await,
            }
        }
    }
}
