//! Result handles returned to callers.
//!
//! Submitting work yields a [`SubmissionHandle`]: an awaitable, cancellable
//! view of one in-flight submission. The handle resolves exactly once, to
//! exactly one of success, failure, or cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::pool::PoolCore;
use crate::submission::SubmissionId;

/// Terminal or pending state of a submission, as seen by its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Not yet terminal: queued or executing.
    Pending,
    /// Completed normally; the result is available.
    Succeeded,
    /// Aborted by a failed command or a disruption.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl SubmissionStatus {
    /// Whether the submission has reached a terminal state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a submission did not produce a result.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmissionError {
    /// A completion predicate failed the command on a specific output line.
    #[error("command `{instruction}` failed on output line {line:?}: {reason}")]
    CommandFailed {
        /// The instruction of the offending command.
        instruction: String,
        /// The output line the predicate rejected.
        line: String,
        /// The reason the predicate gave.
        reason: String,
    },
    /// The submission could not be attempted or was aborted by an unrelated
    /// failure, such as the process dying mid-submission or the pool being
    /// shut down before execution.
    #[error("execution disrupted: {reason}")]
    Disrupted {
        /// What went wrong.
        reason: String,
    },
    /// The submission was cancelled.
    #[error("submission was cancelled")]
    Cancelled,
}

impl SubmissionError {
    pub(crate) fn disrupted(reason: impl Into<String>) -> Self {
        Self::Disrupted {
            reason: reason.into(),
        }
    }
}

/// A time-bounded wait elapsed before the submission reached a terminal
/// state. The submission itself is unaffected.
#[derive(Debug, Clone, thiserror::Error)]
#[error("submission did not complete within {timeout:?}")]
pub struct WaitTimeout {
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// Monotonic once-only status cell shared between a handle and the pool.
#[derive(Debug)]
pub(crate) struct StatusCell(AtomicU8);

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;
const CANCELLED: u8 = 3;

impl StatusCell {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU8::new(PENDING)))
    }

    /// Transition from pending to the given terminal state. Returns `false`
    /// if the cell was already terminal.
    pub(crate) fn settle(&self, status: SubmissionStatus) -> bool {
        let next = match status {
            SubmissionStatus::Pending => return false,
            SubmissionStatus::Succeeded => SUCCEEDED,
            SubmissionStatus::Failed => FAILED,
            SubmissionStatus::Cancelled => CANCELLED,
        };
        self.0
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn get(&self) -> SubmissionStatus {
        match self.0.load(Ordering::Acquire) {
            SUCCEEDED => SubmissionStatus::Succeeded,
            FAILED => SubmissionStatus::Failed,
            CANCELLED => SubmissionStatus::Cancelled,
            _ => SubmissionStatus::Pending,
        }
    }
}

/// Awaitable, cancellable handle to one submitted piece of work.
///
/// Dropping the handle detaches it; the submission keeps executing.
pub struct SubmissionHandle<T> {
    id: SubmissionId,
    core: Weak<PoolCore>,
    status: Arc<StatusCell>,
    rx: oneshot::Receiver<Result<T, SubmissionError>>,
}

impl<T> SubmissionHandle<T> {
    pub(crate) fn new(
        id: SubmissionId,
        core: Weak<PoolCore>,
        status: Arc<StatusCell>,
        rx: oneshot::Receiver<Result<T, SubmissionError>>,
    ) -> Self {
        Self {
            id,
            core,
            status,
            rx,
        }
    }

    /// The identifier of the underlying submission.
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Current status of the submission.
    #[must_use]
    pub fn status(&self) -> SubmissionStatus {
        self.status.get()
    }

    /// Whether the submission has reached a terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status.get().is_terminal()
    }

    /// Whether the submission was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status.get() == SubmissionStatus::Cancelled
    }

    /// Attempt to cancel the submission.
    ///
    /// A queued submission is removed from the queue and resolves as
    /// cancelled. An executing submission is cancelled only when
    /// `may_interrupt` is set: the owning executor's I/O wait is interrupted,
    /// which tears down its child process and replaces it. Returns `false`
    /// if the submission is already terminal or executing without
    /// `may_interrupt`.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        cancel_via(&self.core, self.id, &self.status, may_interrupt)
    }

    /// A cancel-only view of this submission that can outlive the handle.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            core: self.core.clone(),
            status: Arc::clone(&self.status),
        }
    }

    /// Wait until the submission reaches a terminal state and return its
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns the [`SubmissionError`] the submission terminated with.
    pub async fn wait(self) -> Result<T, SubmissionError> {
        let status = Arc::clone(&self.status);
        resolve(self.rx.await, &status)
    }

    /// Wait up to `timeout` for the submission to reach a terminal state.
    ///
    /// Elapsing is non-destructive: the submission keeps running and the
    /// handle can be waited on again.
    ///
    /// # Errors
    ///
    /// Returns [`WaitTimeout`] if the submission was still pending when the
    /// timeout elapsed.
    pub async fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Result<T, SubmissionError>, WaitTimeout> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(received) => Ok(resolve(received, &self.status)),
            Err(_) => Err(WaitTimeout { timeout }),
        }
    }
}

impl<T> fmt::Debug for SubmissionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionHandle")
            .field("id", &self.id)
            .field("status", &self.status.get())
            .finish()
    }
}

/// Cloneable cancel-only view of a submission.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    id: SubmissionId,
    core: Weak<PoolCore>,
    status: Arc<StatusCell>,
}

impl CancelHandle {
    /// The identifier of the underlying submission.
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.id
    }

    /// Attempt to cancel the submission; see [`SubmissionHandle::cancel`].
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        cancel_via(&self.core, self.id, &self.status, may_interrupt)
    }

    /// Whether the submission was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.status.get() == SubmissionStatus::Cancelled
    }
}

fn cancel_via(
    core: &Weak<PoolCore>,
    id: SubmissionId,
    status: &Arc<StatusCell>,
    may_interrupt: bool,
) -> bool {
    if status.get().is_terminal() {
        return false;
    }
    match core.upgrade() {
        Some(core) => core.cancel_submission(id, status, may_interrupt),
        None => false,
    }
}

/// Map the raw channel outcome onto the submission's terminal state. A
/// cancelled submission reports cancellation even if the executor's final
/// send raced a success.
fn resolve<T>(
    received: Result<Result<T, SubmissionError>, oneshot::error::RecvError>,
    status: &StatusCell,
) -> Result<T, SubmissionError> {
    if status.get() == SubmissionStatus::Cancelled {
        return Err(SubmissionError::Cancelled);
    }
    match received {
        Ok(outcome) => outcome,
        Err(_) => Err(SubmissionError::disrupted(
            "pool was dropped before the submission completed",
        )),
    }
}
