//! Instructions and their completion predicates.
//!
//! A [`Command`] is a single line written to a child process' standard input
//! together with the predicates that decide, line by line, when the process
//! has finished responding to it. The predicates *are* the wire protocol:
//! the pool itself attaches no framing to the byte streams.

use std::fmt;
use std::sync::Arc;

/// Which output stream of the child process a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// The child's standard output.
    Stdout,
    /// The child's standard error.
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Failure raised by a completion predicate for a specific output line.
///
/// Returning this from a predicate fails the command and aborts the
/// enclosing submission; the executor replaces its process afterwards.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct CommandFailure {
    reason: String,
}

impl CommandFailure {
    /// Create a new failure with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The reason the predicate gave for failing the command.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Predicate invoked once per output line while its command is active.
///
/// The line has already been appended to the command's capture buffer when
/// the predicate runs, so a multi-line terminator can inspect prior lines
/// through the `&Command` argument. `Ok(true)` marks the command complete;
/// `Ok(false)` keeps consuming lines; `Err` fails the command.
pub type CompletionPredicate =
    Arc<dyn Fn(&Command, &str) -> Result<bool, CommandFailure> + Send + Sync>;

/// One standard-input instruction plus the predicates defining its
/// completion on stdout and stderr.
pub struct Command {
    instruction: String,
    stdout_predicate: Option<CompletionPredicate>,
    stderr_predicate: Option<CompletionPredicate>,
    stdout_lines: Vec<String>,
    stderr_lines: Vec<String>,
}

impl Command {
    /// Create a command that produces no output.
    ///
    /// The command is considered complete as soon as its instruction has
    /// been written; no lines are consumed for it.
    #[must_use]
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            stdout_predicate: None,
            stderr_predicate: None,
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
        }
    }

    /// Create a command completed by the given stdout predicate.
    ///
    /// Any non-empty line on stderr fails the command while it is active.
    #[must_use]
    pub fn expecting_output<P>(instruction: impl Into<String>, stdout_predicate: P) -> Self
    where
        P: Fn(&Command, &str) -> Result<bool, CommandFailure> + Send + Sync + 'static,
    {
        Self::with_predicates(instruction, stdout_predicate, |_: &Command, line: &str| {
            if line.trim().is_empty() {
                Ok(false)
            } else {
                Err(CommandFailure::new(format!(
                    "unexpected standard error output: {line}"
                )))
            }
        })
    }

    /// Create a command with explicit predicates for both output streams.
    #[must_use]
    pub fn with_predicates<P, Q>(
        instruction: impl Into<String>,
        stdout_predicate: P,
        stderr_predicate: Q,
    ) -> Self
    where
        P: Fn(&Command, &str) -> Result<bool, CommandFailure> + Send + Sync + 'static,
        Q: Fn(&Command, &str) -> Result<bool, CommandFailure> + Send + Sync + 'static,
    {
        Self {
            instruction: instruction.into(),
            stdout_predicate: Some(Arc::new(stdout_predicate)),
            stderr_predicate: Some(Arc::new(stderr_predicate)),
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
        }
    }

    /// The instruction written to the child's standard input.
    #[must_use]
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// Whether the command expects the child to respond on its output
    /// streams before it is considered complete.
    #[must_use]
    pub fn generates_output(&self) -> bool {
        self.stdout_predicate.is_some()
    }

    /// The stdout lines captured so far while this command was active.
    #[must_use]
    pub fn stdout_lines(&self) -> &[String] {
        &self.stdout_lines
    }

    /// The stderr lines captured so far while this command was active.
    #[must_use]
    pub fn stderr_lines(&self) -> &[String] {
        &self.stderr_lines
    }

    /// Record a line from the given stream and run the matching predicate.
    ///
    /// Returns `Ok(true)` once the command is complete.
    pub(crate) fn feed(&mut self, stream: StreamKind, line: &str) -> Result<bool, CommandFailure> {
        let predicate = match stream {
            StreamKind::Stdout => {
                self.stdout_lines.push(line.to_owned());
                self.stdout_predicate.clone()
            }
            StreamKind::Stderr => {
                self.stderr_lines.push(line.to_owned());
                self.stderr_predicate.clone()
            }
        };
        match predicate {
            Some(predicate) => predicate(self, line),
            None => Ok(false),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("instruction", &self.instruction)
            .field("generates_output", &self.generates_output())
            .field("stdout_lines", &self.stdout_lines.len())
            .field("stderr_lines", &self.stderr_lines.len())
            .finish()
    }
}
