//! # procpool
//!
//! A dynamically sized pool of reusable child processes driven over
//! line-oriented standard I/O.
//!
//! Callers hand in [`Submission`]s: ordered sequences of [`Command`]s, each
//! one instruction written to a child's stdin plus the predicates that
//! decide, line by line, when the process has finished responding. The pool
//! picks a free executor (or spawns one, bounded by the configured maximum),
//! drains the submission through it, and returns a [`SubmissionHandle`] the
//! caller can await or cancel. Idle executors above the minimum retire after
//! a keep-alive interval; a configurable reserve of warm executors hides
//! spawn latency.
//!
//! ## Example
//!
//! ```rust,no_run
//! use procpool::{
//!     Command, PoolConfig, ProcessManager, ProcessPool, ProcessSpec,
//!     SimpleProcessManager, Submission,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = || -> Box<dyn ProcessManager> {
//!     Box::new(SimpleProcessManager::new(ProcessSpec::new("/bin/sh")))
//! };
//! let pool = ProcessPool::new(factory, PoolConfig::new(2, 4, 1)).await?;
//!
//! let submission = Submission::builder()
//!     .command(Command::expecting_output("echo ready", |_, line| {
//!         Ok(line == "ready")
//!     }))
//!     .build();
//! let handle = pool.submit(submission)?;
//! handle.wait().await?;
//!
//! pool.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod batch;
pub mod command;
pub mod config;
pub mod executor;
pub mod handle;
pub mod manager;
pub mod pool;
mod queue;
pub mod submission;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::{InvokeAllOutcome, InvokeAnyError};
    pub use crate::command::{Command, CommandFailure, StreamKind};
    pub use crate::config::PoolConfig;
    pub use crate::handle::{CancelHandle, SubmissionError, SubmissionHandle, SubmissionStatus};
    pub use crate::manager::{
        ProcessManager, ProcessManagerFactory, ProcessSpec, SimpleProcessManager,
    };
    pub use crate::pool::{ProcessPool, SubmitError};
    pub use crate::submission::Submission;
}

/// Re-export commonly used types at the crate root.
pub use batch::{InvokeAllOutcome, InvokeAnyError};
pub use command::{Command, CommandFailure, CompletionPredicate, StreamKind};
pub use config::{ConfigError, PoolConfig};
pub use executor::{ExecutorError, ExecutorId, ExecutorSnapshot, ExecutorState};
pub use handle::{CancelHandle, SubmissionError, SubmissionHandle, SubmissionStatus, WaitTimeout};
pub use manager::{
    ProcessManager, ProcessManagerFactory, ProcessSpec, SimpleProcessManager, SpawnError,
};
pub use pool::{PendingSubmission, PoolError, PoolSnapshot, ProcessPool, SubmitError};
pub use submission::{Submission, SubmissionBuilder, SubmissionId};
