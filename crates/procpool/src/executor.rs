//! Per-process executors.
//!
//! A process executor owns one child process over its lifetime: the
//! process handle, its stdin writer, and the reader tasks that decode its
//! output streams into lines. It executes one submission at a time by
//! writing each command's instruction and consuming output lines through the
//! command's completion predicates.
//!
//! # Architecture
//!
//! ```text
//! stdin  ◄── executor worker (one instruction per command)
//! stdout ──► reader task ──┐
//! stderr ──► reader task ──┴──► line channel ──► active command predicates
//! ```
//!
//! Lines arriving while no command is active are discarded; the channel is
//! drained before each command is dispatched.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::command::{Command, CommandFailure, StreamKind};
use crate::handle::SubmissionError;
use crate::manager::{ProcessManager, SpawnError};
use crate::submission::{Slot, Submission, SubmissionId};

/// Bound on buffered output lines per executor.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Unique identifier for an executor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorId(Uuid);

impl ExecutorId {
    /// Create a new random executor ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Executor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorState {
    /// A process is being spawned and walked through its startup commands.
    Starting,

    /// The process is up and waiting for a submission.
    Idle,

    /// Exactly one submission is executing on the process.
    Executing,

    /// The process is being terminated.
    Stopping,

    /// The process has terminated.
    Stopped,
}

impl ExecutorState {
    /// Returns `true` if the executor can accept a submission.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns `true` if the executor is on its way out or gone.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Idle => write!(f, "idle"),
            Self::Executing => write!(f, "executing"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of one executor slot at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSnapshot {
    /// Executor identifier.
    pub id: ExecutorId,
    /// Current state.
    pub state: ExecutorState,
    /// OS process ID of the current child, if one is running.
    pub pid: Option<u32>,
    /// When the current child was spawned.
    pub started_at: Option<DateTime<Utc>>,
    /// Submissions completed by the current child.
    pub executions: u64,
}

/// Error types for executor startup.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The child process could not be spawned.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// The manager's startup command sequence failed.
    #[error("startup commands failed: {0}")]
    Startup(#[source] SubmissionError),
}

/// What the pool should do with the executor slot after a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Keep the process; the executor returns to idle.
    Retain,
    /// Terminate the process and start a fresh one in the same slot.
    Replace {
        /// Kill outright instead of running the termination sequence.
        forcibly: bool,
    },
}

/// A line read from one of the child's output streams.
#[derive(Debug)]
struct OutputLine {
    stream: StreamKind,
    line: String,
}

/// One running child process and the machinery to drive submissions
/// through it.
pub(crate) struct ProcessExecutor {
    id: ExecutorId,
    child: Child,
    pid: u32,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<OutputLine>,
    state: ExecutorState,
    started_at: DateTime<Utc>,
    execution_count: u64,
    total_runtime: Duration,
    grace_period: Duration,
}

impl ProcessExecutor {
    /// Spawn a process via the manager, wire up its streams, and run the
    /// manager's startup command sequence to completion.
    pub(crate) async fn start(
        id: ExecutorId,
        manager: &mut dyn ProcessManager,
        grace_period: Duration,
    ) -> Result<Self, ExecutorError> {
        let mut child = manager.spawn()?;
        let pid = child.id().ok_or(SpawnError::MissingPid)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingStdio { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingStdio { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingStdio { stream: "stderr" })?;

        let (line_tx, lines) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        spawn_reader(id, stdout, StreamKind::Stdout, line_tx.clone());
        spawn_reader(id, stderr, StreamKind::Stderr, line_tx);

        let mut executor = Self {
            id,
            child,
            pid,
            stdin: Some(stdin),
            lines,
            state: ExecutorState::Starting,
            started_at: Utc::now(),
            execution_count: 0,
            total_runtime: Duration::ZERO,
            grace_period,
        };
        debug!(executor = %id, pid, "child process spawned");

        if let Some(mut submission) = manager.startup_submission() {
            executor
                .run_direct(&mut submission)
                .await
                .map_err(ExecutorError::Startup)?;
        }
        manager.on_startup(pid);
        executor.state = ExecutorState::Idle;
        Ok(executor)
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub(crate) fn total_runtime(&self) -> Duration {
        self.total_runtime
    }

    /// Execute one submission to completion.
    ///
    /// The caller's handle is resolved exactly once before this returns. The
    /// returned disposition tells the pool whether the process survives.
    pub(crate) async fn execute(
        &mut self,
        mut slot: Slot,
        interrupt: &mut watch::Receiver<Option<SubmissionId>>,
    ) -> Disposition {
        let Some(mut work) = slot.work.take() else {
            return Disposition::Retain;
        };
        let id = slot.id;
        self.state = ExecutorState::Executing;
        let started = Instant::now();

        debug!(executor = %self.id, submission = %id, "submission dispatched");
        work.notify_start(self.pid);

        let mut outcome = Ok(());
        'commands: for index in 0..work.commands_mut().len() {
            if *interrupt.borrow_and_update() == Some(id) {
                outcome = Err(SubmissionError::Cancelled);
                break;
            }
            self.discard_pending_lines();

            let command = &mut work.commands_mut()[index];
            if let Err(error) = self.write_instruction(command.instruction()).await {
                outcome = Err(error);
                break;
            }
            if !command.generates_output() {
                continue;
            }
            loop {
                tokio::select! {
                    received = self.lines.recv() => match received {
                        Some(OutputLine { stream, line }) => {
                            match command.feed(stream, &line) {
                                Ok(true) => continue 'commands,
                                Ok(false) => {}
                                Err(failure) => {
                                    outcome = Err(command_failed(command, &line, &failure));
                                    break 'commands;
                                }
                            }
                        }
                        None => {
                            outcome = Err(SubmissionError::disrupted(
                                "process terminated while a command was awaiting completion",
                            ));
                            break 'commands;
                        }
                    },
                    changed = interrupt.changed() => {
                        if changed.is_err() || *interrupt.borrow_and_update() == Some(id) {
                            outcome = Err(SubmissionError::Cancelled);
                            break 'commands;
                        }
                    }
                }
            }
        }

        self.total_runtime += started.elapsed();
        work.notify_finish();
        self.state = ExecutorState::Idle;

        match outcome {
            Ok(()) => {
                self.execution_count += 1;
                let terminate = work.terminate_after();
                work.succeed();
                debug!(executor = %self.id, submission = %id, "submission completed");
                if terminate {
                    Disposition::Replace { forcibly: false }
                } else {
                    Disposition::Retain
                }
            }
            Err(error) => {
                match &error {
                    SubmissionError::Cancelled => {
                        debug!(executor = %self.id, submission = %id, "submission cancelled");
                    }
                    error => {
                        warn!(executor = %self.id, submission = %id, %error, "submission aborted");
                    }
                }
                work.fail(error);
                Disposition::Replace { forcibly: true }
            }
        }
    }

    /// Terminate the child process.
    ///
    /// Graceful stops run the manager's termination command sequence, close
    /// stdin, and give the child the grace period to exit before killing it.
    /// Forcible stops kill outright.
    pub(crate) async fn stop(
        mut self,
        manager: &mut dyn ProcessManager,
        forcibly: bool,
    ) -> Option<i32> {
        self.state = ExecutorState::Stopping;

        if !forcibly {
            if let Some(mut submission) = manager.termination_submission() {
                match tokio::time::timeout(self.grace_period, self.run_direct(&mut submission))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        debug!(executor = %self.id, %error, "termination commands failed");
                    }
                    Err(_) => {
                        debug!(executor = %self.id, "termination commands timed out");
                    }
                }
            }
        }

        drop(self.stdin.take());
        let status = if forcibly {
            let _ = self.child.start_kill();
            self.child.wait().await.ok()
        } else {
            match tokio::time::timeout(self.grace_period, self.child.wait()).await {
                Ok(waited) => waited.ok(),
                Err(_) => {
                    warn!(executor = %self.id, "grace period expired; killing process");
                    let _ = self.child.start_kill();
                    self.child.wait().await.ok()
                }
            }
        };

        let exit_code = status.and_then(|status| status.code());
        self.state = ExecutorState::Stopped;
        manager.on_termination(exit_code);
        debug!(executor = %self.id, exit_code, "process executor stopped");
        exit_code
    }

    /// Run a startup or termination command sequence outside the submission
    /// pipeline, without cancellation.
    async fn run_direct(&mut self, submission: &mut Submission<()>) -> Result<(), SubmissionError> {
        submission.invoke_start(self.pid);
        for index in 0..submission.commands_mut().len() {
            self.discard_pending_lines();
            let command = &mut submission.commands_mut()[index];
            self.write_instruction(command.instruction()).await?;
            if !command.generates_output() {
                continue;
            }
            loop {
                match self.lines.recv().await {
                    Some(OutputLine { stream, line }) => match command.feed(stream, &line) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(failure) => return Err(command_failed(command, &line, &failure)),
                    },
                    None => {
                        return Err(SubmissionError::disrupted(
                            "process terminated while a command was awaiting completion",
                        ));
                    }
                }
            }
        }
        submission.invoke_finish();
        Ok(())
    }

    /// Write one instruction line to the child's stdin and flush it.
    async fn write_instruction(&mut self, instruction: &str) -> Result<(), SubmissionError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SubmissionError::disrupted("child stdin is closed"));
        };
        let write = async {
            stdin.write_all(instruction.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|error| {
            SubmissionError::disrupted(format!("failed to write to child stdin: {error}"))
        })?;
        trace!(executor = %self.id, instruction, "instruction dispatched");
        Ok(())
    }

    /// Drop lines that arrived outside any command's scope.
    fn discard_pending_lines(&mut self) {
        while let Ok(OutputLine { stream, line }) = self.lines.try_recv() {
            trace!(executor = %self.id, %stream, %line, "discarding output outside command scope");
        }
    }
}

impl fmt::Debug for ProcessExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessExecutor")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("execution_count", &self.execution_count)
            .finish()
    }
}

fn command_failed(command: &Command, line: &str, failure: &CommandFailure) -> SubmissionError {
    SubmissionError::CommandFailed {
        instruction: command.instruction().to_owned(),
        line: line.to_owned(),
        reason: failure.reason().to_owned(),
    }
}

/// Forward decoded lines from one output stream into the shared channel
/// until the stream closes.
fn spawn_reader<R>(id: ExecutorId, stream: R, kind: StreamKind, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx
                        .send(OutputLine { stream: kind, line })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(executor = %id, stream = %kind, %error, "output reader failed");
                    break;
                }
            }
        }
        trace!(executor = %id, stream = %kind, "output reader finished");
    });
}
