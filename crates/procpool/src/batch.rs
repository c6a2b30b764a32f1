//! Aggregate submission operations.
//!
//! Convenience helpers layered over the core pool: submit a batch and wait
//! for all of it, or race a batch and keep the first success. Both operate
//! against one shared time budget; exhausting it cancels whatever is still
//! pending, interrupting executing submissions.

use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::FuturesUnordered;

use crate::handle::{SubmissionError, SubmissionHandle};
use crate::pool::{ProcessPool, SubmitError};
use crate::submission::Submission;

/// Outcome of [`ProcessPool::invoke_all`].
#[derive(Debug)]
pub struct InvokeAllOutcome<T> {
    /// Terminal outcome of every submission, in submit order.
    pub results: Vec<Result<T, SubmissionError>>,
    /// Whether the shared budget ran out before all submissions finished.
    pub timed_out: bool,
}

/// Error types for [`ProcessPool::invoke_any`].
#[derive(Debug, thiserror::Error)]
pub enum InvokeAnyError {
    /// No submissions were provided.
    #[error("no submissions were provided")]
    Empty,

    /// The pool rejected a submission.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// The shared budget ran out before any submission succeeded.
    #[error("no submission completed within {timeout:?}")]
    Timeout {
        /// The exhausted budget.
        timeout: Duration,
    },

    /// Every submission reached a terminal state without success.
    #[error("every submission failed; last error: {last}")]
    AllFailed {
        /// The most recent failure.
        last: SubmissionError,
    },
}

impl ProcessPool {
    /// Submit all given submissions and wait for each within one shared
    /// time budget.
    ///
    /// On budget exhaustion every still-pending submission is cancelled
    /// with interruption; its entry in the outcome reports cancellation.
    /// Results are in submit order.
    ///
    /// # Errors
    ///
    /// Returns a [`SubmitError`] if a submission is rejected; earlier
    /// submissions of the batch keep executing.
    pub async fn invoke_all<T: Send + 'static>(
        &self,
        submissions: Vec<Submission<T>>,
        budget: Duration,
    ) -> Result<InvokeAllOutcome<T>, SubmitError> {
        let mut handles = Vec::with_capacity(submissions.len());
        for submission in submissions {
            handles.push(self.submit(submission)?);
        }

        let deadline = Instant::now() + budget;
        let mut timed_out = false;
        let mut results = Vec::with_capacity(handles.len());
        for mut handle in handles {
            if !timed_out {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match handle.wait_timeout(remaining).await {
                    Ok(outcome) => {
                        results.push(outcome);
                        continue;
                    }
                    Err(_) => timed_out = true,
                }
            }
            handle.cancel(true);
            results.push(handle.wait().await);
        }
        Ok(InvokeAllOutcome { results, timed_out })
    }

    /// Submit all given submissions and return the first successful result,
    /// cancelling the rest.
    ///
    /// # Errors
    ///
    /// [`InvokeAnyError::Timeout`] if the budget ran out with no success,
    /// [`InvokeAnyError::AllFailed`] if every submission ended in failure.
    pub async fn invoke_any<T: Send + 'static>(
        &self,
        submissions: Vec<Submission<T>>,
        budget: Duration,
    ) -> Result<T, InvokeAnyError> {
        if submissions.is_empty() {
            return Err(InvokeAnyError::Empty);
        }
        let mut handles = Vec::with_capacity(submissions.len());
        for submission in submissions {
            handles.push(self.submit(submission)?);
        }
        let cancellers: Vec<_> = handles.iter().map(SubmissionHandle::cancel_handle).collect();
        let mut waits: FuturesUnordered<_> =
            handles.into_iter().map(SubmissionHandle::wait).collect();

        let deadline = Instant::now() + budget;
        let mut last_failure = None;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, waits.next()).await {
                Ok(Some(Ok(value))) => {
                    for canceller in &cancellers {
                        canceller.cancel(true);
                    }
                    return Ok(value);
                }
                Ok(Some(Err(error))) => last_failure = Some(error),
                Ok(None) => {
                    return Err(InvokeAnyError::AllFailed {
                        last: last_failure.unwrap_or_else(|| {
                            SubmissionError::disrupted("no submission produced an outcome")
                        }),
                    });
                }
                Err(_) => {
                    for canceller in &cancellers {
                        canceller.cancel(true);
                    }
                    return Err(InvokeAnyError::Timeout { timeout: budget });
                }
            }
        }
    }
}
