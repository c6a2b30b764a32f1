//! Units of work executed on one child process.
//!
//! A [`Submission`] is an ordered sequence of [`Command`]s executed strictly
//! sequentially on a single process, plus lifecycle hooks and an optional
//! request to terminate the process afterwards. The result published through
//! the caller's handle is produced by the `result` closure, typically fed by
//! state the hooks or predicates captured.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex};
//! use procpool::{Command, Submission};
//!
//! let captured = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&captured);
//! let submission = Submission::builder()
//!     .command(Command::expecting_output("status", move |command, line| {
//!         if line == "ready" {
//!             sink.lock().unwrap().extend_from_slice(command.stdout_lines());
//!             Ok(true)
//!         } else {
//!             Ok(false)
//!         }
//!     }))
//!     .result(move || captured.lock().unwrap().clone())
//!     .build();
//! # let _ = submission;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::oneshot;

use crate::command::Command;
use crate::handle::{StatusCell, SubmissionError, SubmissionStatus};

/// Counter backing [`SubmissionId`] allocation.
static SUBMISSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a submission within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub struct SubmissionId(u64);

impl SubmissionId {
    pub(crate) fn next() -> Self {
        Self(SUBMISSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type StartHook = Box<dyn FnMut(u32) + Send>;
type FinishHook = Box<dyn FnMut() + Send>;

/// An ordered sequence of commands executed on exactly one process.
pub struct Submission<T> {
    commands: Vec<Command>,
    terminate_after: bool,
    on_start: Option<StartHook>,
    on_finish: Option<FinishHook>,
    result: Box<dyn FnOnce() -> T + Send>,
}

impl Submission<()> {
    /// Start building a submission.
    #[must_use]
    pub fn builder() -> SubmissionBuilder<()> {
        SubmissionBuilder {
            commands: Vec::new(),
            terminate_after: false,
            on_start: None,
            on_finish: None,
            result: Box::new(|| ()),
        }
    }

    /// A unit-result submission from a list of commands.
    #[must_use]
    pub fn from_commands(commands: Vec<Command>) -> Self {
        let mut builder = Self::builder();
        builder.commands = commands;
        builder.build()
    }
}

impl<T> Submission<T> {
    /// The commands this submission will execute, in order.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Whether the executing process is terminated and replaced after this
    /// submission, regardless of outcome.
    #[must_use]
    pub fn terminate_after(&self) -> bool {
        self.terminate_after
    }

    pub(crate) fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    pub(crate) fn invoke_start(&mut self, pid: u32) {
        if let Some(hook) = self.on_start.as_mut() {
            hook(pid);
        }
    }

    pub(crate) fn invoke_finish(&mut self) {
        if let Some(hook) = self.on_finish.as_mut() {
            hook();
        }
    }

    pub(crate) fn into_result(self) -> T {
        (self.result)()
    }
}

impl<T> fmt::Debug for Submission<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("commands", &self.commands.len())
            .field("terminate_after", &self.terminate_after)
            .finish()
    }
}

/// Builder for [`Submission`].
pub struct SubmissionBuilder<T> {
    commands: Vec<Command>,
    terminate_after: bool,
    on_start: Option<StartHook>,
    on_finish: Option<FinishHook>,
    result: Box<dyn FnOnce() -> T + Send>,
}

impl<T> SubmissionBuilder<T> {
    /// Append a command to the sequence.
    #[must_use]
    pub fn command(mut self, command: Command) -> Self {
        self.commands.push(command);
        self
    }

    /// Append several commands to the sequence.
    #[must_use]
    pub fn commands<I>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = Command>,
    {
        self.commands.extend(commands);
        self
    }

    /// Terminate and replace the executing process after this submission.
    #[must_use]
    pub fn terminate_after(mut self, terminate: bool) -> Self {
        self.terminate_after = terminate;
        self
    }

    /// Hook invoked with the child's PID just before the first command is
    /// dispatched.
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut(u32) + Send + 'static,
    {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Hook invoked when the submission finishes executing.
    #[must_use]
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        self.on_finish = Some(Box::new(hook));
        self
    }

    /// Closure producing the value published through the caller's handle on
    /// success. Replaces the result type of the submission under
    /// construction.
    #[must_use]
    pub fn result<U, F>(self, result: F) -> SubmissionBuilder<U>
    where
        F: FnOnce() -> U + Send + 'static,
    {
        SubmissionBuilder {
            commands: self.commands,
            terminate_after: self.terminate_after,
            on_start: self.on_start,
            on_finish: self.on_finish,
            result: Box::new(result),
        }
    }

    /// Build the submission.
    #[must_use]
    pub fn build(self) -> Submission<T> {
        Submission {
            commands: self.commands,
            terminate_after: self.terminate_after,
            on_start: self.on_start,
            on_finish: self.on_finish,
            result: self.result,
        }
    }
}

impl<T> fmt::Debug for SubmissionBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmissionBuilder")
            .field("commands", &self.commands.len())
            .field("terminate_after", &self.terminate_after)
            .finish()
    }
}

/// Type-erased submission as carried through the queue and executors.
///
/// Resolving the caller's handle happens exactly once, through either
/// [`ErasedSubmission::succeed`] or [`ErasedSubmission::fail`].
pub(crate) trait ErasedSubmission: Send {
    fn commands_mut(&mut self) -> &mut [Command];
    fn terminate_after(&self) -> bool;
    fn notify_start(&mut self, pid: u32);
    fn notify_finish(&mut self);
    fn instructions(&self) -> Vec<String>;
    fn succeed(self: Box<Self>);
    fn fail(self: Box<Self>, error: SubmissionError);
}

/// Bridges a typed [`Submission`] to its handle's result channel.
pub(crate) struct TypedSubmission<T> {
    submission: Submission<T>,
    status: Arc<StatusCell>,
    tx: oneshot::Sender<Result<T, SubmissionError>>,
}

impl<T: Send + 'static> TypedSubmission<T> {
    pub(crate) fn new(
        submission: Submission<T>,
        status: Arc<StatusCell>,
        tx: oneshot::Sender<Result<T, SubmissionError>>,
    ) -> Self {
        Self {
            submission,
            status,
            tx,
        }
    }
}

impl<T: Send + 'static> ErasedSubmission for TypedSubmission<T> {
    fn commands_mut(&mut self) -> &mut [Command] {
        self.submission.commands_mut()
    }

    fn terminate_after(&self) -> bool {
        self.submission.terminate_after()
    }

    fn notify_start(&mut self, pid: u32) {
        self.submission.invoke_start(pid);
    }

    fn notify_finish(&mut self) {
        self.submission.invoke_finish();
    }

    fn instructions(&self) -> Vec<String> {
        self.submission
            .commands()
            .iter()
            .map(|command| command.instruction().to_owned())
            .collect()
    }

    fn succeed(self: Box<Self>) {
        let this = *self;
        let value = this.submission.into_result();
        this.status.settle(SubmissionStatus::Succeeded);
        let _ = this.tx.send(Ok(value));
    }

    fn fail(self: Box<Self>, error: SubmissionError) {
        let this = *self;
        let status = match error {
            SubmissionError::Cancelled => SubmissionStatus::Cancelled,
            _ => SubmissionStatus::Failed,
        };
        this.status.settle(status);
        let _ = this.tx.send(Err(error));
    }
}

/// A queue entry: one erased submission plus its identifier.
///
/// Removal on cancellation takes the work out and leaves the slot behind as
/// a tombstone, so queue bookkeeping stays balanced. A slot dropped with its
/// work still inside resolves the caller's handle as disrupted.
pub(crate) struct Slot {
    pub(crate) id: SubmissionId,
    pub(crate) work: Option<Box<dyn ErasedSubmission>>,
}

impl Slot {
    pub(crate) fn new(id: SubmissionId, work: Box<dyn ErasedSubmission>) -> Self {
        Self {
            id,
            work: Some(work),
        }
    }

    pub(crate) fn is_tombstone(&self) -> bool {
        self.work.is_none()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(work) = self.work.take() {
            work.fail(SubmissionError::disrupted(
                "pool shut down before the submission was executed",
            ));
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("tombstone", &self.is_tombstone())
            .finish()
    }
}
