//! Cancellation and deadline propagation for extension callbacks.
//!
//! An [`ExtensionContext`] pairs a [`CancellationToken`] with an optional
//! absolute deadline. Children inherit both: cancelling a parent cancels every
//! child, and a child's deadline is never later than its parent's.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

/// Deadlines further away than this are tracked but never armed as timers.
const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Why a context stopped.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The context, or one of its parents, was cancelled.
    #[error("context cancelled")]
    Cancelled,

    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellation scope with an optional absolute deadline.
#[derive(Debug, Clone, Default)]
pub struct ExtensionContext {
    token: CancellationToken,
    deadline: Option<SystemTime>,
}

impl ExtensionContext {
    /// Creates a root context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a root context driven by an existing cancellation token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a child that is cancelled together with this context.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derives a child whose deadline is the earlier of `deadline` and the
    /// deadline of this context.
    pub fn with_deadline(&self, deadline: SystemTime) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };

        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Derives a child with a deadline given in epoch milliseconds, the unit
    /// used by the Extensions API.
    pub fn with_deadline_ms(&self, deadline_ms: i64) -> Self {
        match system_time_from_millis(deadline_ms) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Returns the absolute deadline, if any.
    pub fn deadline(&self) -> Option<SystemTime> {
        self.deadline
    }

    /// Returns the absolute deadline in epoch milliseconds, if any.
    pub fn deadline_ms(&self) -> Option<i64> {
        let since_epoch = self.deadline?.duration_since(UNIX_EPOCH).ok()?;
        i64::try_from(since_epoch.as_millis()).ok()
    }

    /// Returns the underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns why the context stopped, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }

        match self.deadline {
            Some(deadline) if SystemTime::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Returns `true` once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        if let Some(err) = self.err() {
            return err;
        }

        match self.timer_deadline() {
            Some(at) => tokio::select! {
                biased;
                () = self.token.cancelled() => ContextError::Cancelled,
                () = tokio::time::sleep_until(at) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Runs `fut` until it completes or the context stops, whichever is first.
    ///
    /// # Errors
    ///
    /// Returns the [`ContextError`] if the context stops first; `fut` is
    /// dropped in that case.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = fut => Ok(output),
        }
    }

    fn timer_deadline(&self) -> Option<tokio::time::Instant> {
        let remaining = self
            .deadline?
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        if remaining > MAX_TIMER {
            return None;
        }

        tokio::time::Instant::now().checked_add(remaining)
    }
}

fn system_time_from_millis(deadline_ms: i64) -> Option<SystemTime> {
    if deadline_ms >= 0 {
        UNIX_EPOCH.checked_add(Duration::from_millis(deadline_ms.unsigned_abs()))
    } else {
        UNIX_EPOCH.checked_sub(Duration::from_millis(deadline_ms.unsigned_abs()))
    }
}
