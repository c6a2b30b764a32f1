//! Process lifecycle management supplied by the caller.
//!
//! A [`ProcessManager`] knows how to spawn one child process and how to walk
//! it through its life: an optional startup command sequence before the
//! executor becomes available, an optional termination sequence on graceful
//! stop, and a recycling policy deciding how long the process is kept.
//! A [`ProcessManagerFactory`] produces one manager per executor slot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::submission::Submission;

/// Error types for spawning child processes.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The OS failed to start the process.
    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The spawned process has no obtainable PID.
    #[error("failed to get process ID")]
    MissingPid,

    /// A required stdio stream was not piped.
    #[error("child process {stream} stream was not piped")]
    MissingStdio {
        /// Which stream was missing.
        stream: &'static str,
    },
}

/// Manages the lifecycle of the child processes of one executor slot.
///
/// Every process spawned by a manager must have stdin, stdout, and stderr
/// piped; the pool drives the process exclusively over those streams.
pub trait ProcessManager: Send {
    /// Spawn a new child process with all three stdio streams piped.
    ///
    /// # Errors
    ///
    /// Returns a [`SpawnError`] if the process cannot be started.
    fn spawn(&mut self) -> Result<Child, SpawnError>;

    /// Command sequence executed on a freshly spawned process before the
    /// executor becomes available. A failure here fails the executor.
    fn startup_submission(&mut self) -> Option<Submission<()>> {
        None
    }

    /// Command sequence executed on graceful termination, before stdin is
    /// closed. Failures are logged and the process is killed regardless.
    fn termination_submission(&mut self) -> Option<Submission<()>> {
        None
    }

    /// Observer invoked once a new process is ready for use.
    fn on_startup(&mut self, pid: u32) {
        let _ = pid;
    }

    /// Observer invoked after the process has terminated.
    fn on_termination(&mut self, exit_code: Option<i32>) {
        let _ = exit_code;
    }

    /// Whether to keep the current process after another completed
    /// submission. Returning `false` recycles the process: the executor
    /// terminates it and starts a fresh one in its place.
    fn should_retain(&mut self, execution_count: u64, total_runtime: Duration) -> bool {
        let _ = (execution_count, total_runtime);
        true
    }
}

/// Produces one [`ProcessManager`] per executor slot.
pub trait ProcessManagerFactory: Send + Sync {
    /// Create the manager for a new executor slot.
    fn new_manager(&self) -> Box<dyn ProcessManager>;
}

impl<F> ProcessManagerFactory for F
where
    F: Fn() -> Box<dyn ProcessManager> + Send + Sync,
{
    fn new_manager(&self) -> Box<dyn ProcessManager> {
        self()
    }
}

/// Process specification - defines what to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Command to execute.
    pub command: String,

    /// Command arguments.
    pub args: Vec<String>,

    /// Working directory.
    pub cwd: Option<PathBuf>,

    /// Environment variables.
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    /// Create a spec running the given command with no arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Create a new builder for `ProcessSpec`.
    #[must_use]
    pub fn builder() -> ProcessSpecBuilder {
        ProcessSpecBuilder::default()
    }

    /// Spawn a process according to this specification.
    ///
    /// All three stdio streams are piped; the child is killed if its handle
    /// is dropped while still running.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Spawn`] if the process cannot be spawned.
    pub fn spawn(&self) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&self.command);

        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        cmd.spawn().map_err(SpawnError::Spawn)
    }
}

/// Builder for `ProcessSpec`.
#[derive(Debug, Default)]
pub struct ProcessSpecBuilder {
    command: Option<String>,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl ProcessSpecBuilder {
    /// Set the command to execute.
    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set command arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Build the `ProcessSpec`.
    ///
    /// # Panics
    ///
    /// Panics if `command` is not set.
    #[must_use]
    pub fn build(self) -> ProcessSpec {
        ProcessSpec {
            command: self.command.expect("command is required"),
            args: self.args,
            cwd: self.cwd,
            env: self.env,
        }
    }
}

type SubmissionFactory = Box<dyn FnMut() -> Submission<()> + Send>;

/// A [`ProcessManager`] driven by a [`ProcessSpec`] plus optional startup
/// and termination command sequences and recycling limits.
pub struct SimpleProcessManager {
    spec: ProcessSpec,
    startup: Option<SubmissionFactory>,
    termination: Option<SubmissionFactory>,
    max_executions: Option<u64>,
    max_total_runtime: Option<Duration>,
}

impl SimpleProcessManager {
    /// Create a manager spawning processes from the given spec.
    #[must_use]
    pub fn new(spec: ProcessSpec) -> Self {
        Self {
            spec,
            startup: None,
            termination: None,
            max_executions: None,
            max_total_runtime: None,
        }
    }

    /// Command sequence run on every fresh process before it serves work.
    #[must_use]
    pub fn with_startup<F>(mut self, startup: F) -> Self
    where
        F: FnMut() -> Submission<()> + Send + 'static,
    {
        self.startup = Some(Box::new(startup));
        self
    }

    /// Command sequence run on graceful termination.
    #[must_use]
    pub fn with_termination<F>(mut self, termination: F) -> Self
    where
        F: FnMut() -> Submission<()> + Send + 'static,
    {
        self.termination = Some(Box::new(termination));
        self
    }

    /// Recycle the process after it has executed this many submissions.
    #[must_use]
    pub const fn with_max_executions(mut self, max_executions: u64) -> Self {
        self.max_executions = Some(max_executions);
        self
    }

    /// Recycle the process once its accumulated execution time exceeds this.
    #[must_use]
    pub const fn with_max_total_runtime(mut self, max_total_runtime: Duration) -> Self {
        self.max_total_runtime = Some(max_total_runtime);
        self
    }
}

impl ProcessManager for SimpleProcessManager {
    fn spawn(&mut self) -> Result<Child, SpawnError> {
        self.spec.spawn()
    }

    fn startup_submission(&mut self) -> Option<Submission<()>> {
        self.startup.as_mut().map(|factory| factory())
    }

    fn termination_submission(&mut self) -> Option<Submission<()>> {
        self.termination.as_mut().map(|factory| factory())
    }

    fn should_retain(&mut self, execution_count: u64, total_runtime: Duration) -> bool {
        if self
            .max_executions
            .is_some_and(|limit| execution_count >= limit)
        {
            return false;
        }
        !self
            .max_total_runtime
            .is_some_and(|limit| total_runtime >= limit)
    }
}

impl std::fmt::Debug for SimpleProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleProcessManager")
            .field("spec", &self.spec)
            .field("startup", &self.startup.is_some())
            .field("termination", &self.termination.is_some())
            .field("max_executions", &self.max_executions)
            .field("max_total_runtime", &self.max_total_runtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command as PoolCommand;

    #[test]
    fn test_process_spec_builder() {
        let spec = ProcessSpec::builder()
            .command("echo")
            .args(["hello", "world"])
            .cwd("/tmp")
            .env("FOO", "bar")
            .build();

        assert_eq!(spec.command, "echo");
        assert_eq!(spec.args, vec!["hello", "world"]);
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.env.get("FOO"), Some(&"bar".to_string()));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_pipes_all_streams() {
        let spec = ProcessSpec::builder().command("cat").build();

        let mut child = spec.spawn().unwrap();
        assert!(child.stdin.is_some());
        assert!(child.stdout.is_some());
        assert!(child.stderr.is_some());

        drop(child.stdin.take());
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_spawn_invalid_command() {
        let spec = ProcessSpec::new("nonexistent_command_12345");
        assert!(matches!(spec.spawn(), Err(SpawnError::Spawn(_))));
    }

    #[test]
    fn test_simple_manager_recycles_on_execution_limit() {
        let mut manager =
            SimpleProcessManager::new(ProcessSpec::new("cat")).with_max_executions(3);

        assert!(manager.should_retain(2, Duration::from_secs(1)));
        assert!(!manager.should_retain(3, Duration::from_secs(1)));
    }

    #[test]
    fn test_simple_manager_recycles_on_runtime_limit() {
        let mut manager = SimpleProcessManager::new(ProcessSpec::new("cat"))
            .with_max_total_runtime(Duration::from_secs(10));

        assert!(manager.should_retain(100, Duration::from_secs(9)));
        assert!(!manager.should_retain(1, Duration::from_secs(10)));
    }

    #[test]
    fn test_simple_manager_builds_fresh_startup_submissions() {
        let mut manager = SimpleProcessManager::new(ProcessSpec::new("cat")).with_startup(|| {
            Submission::from_commands(vec![PoolCommand::new("init")])
        });

        let first = manager.startup_submission().unwrap();
        let second = manager.startup_submission().unwrap();
        assert_eq!(first.commands().len(), 1);
        assert_eq!(second.commands()[0].instruction(), "init");
        assert!(manager.termination_submission().is_none());
    }

    #[test]
    fn test_closure_factory_produces_managers() {
        let factory = || -> Box<dyn ProcessManager> {
            Box::new(SimpleProcessManager::new(ProcessSpec::new("cat")))
        };
        let _manager = factory.new_manager();
    }
}
