//! The pool controller.
//!
//! Maintains the set of executors between the configured minimum and
//! maximum, dispatches queued submissions to idle executors, applies the
//! idle keep-alive and reserve policies, and coordinates shutdown.
//!
//! Each executor slot is driven by its own worker task: start a process,
//! serve submissions from the queue, and either return to idle, replace the
//! process in place, retire on keep-alive expiry, or stop on shutdown.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, PoolConfig};
use crate::executor::{
    Disposition, ExecutorError, ExecutorId, ExecutorSnapshot, ExecutorState, ProcessExecutor,
};
use crate::handle::{StatusCell, SubmissionError, SubmissionHandle, SubmissionStatus};
use crate::manager::ProcessManagerFactory;
use crate::queue::SubmissionQueue;
use crate::submission::{Slot, Submission, SubmissionId, TypedSubmission};

/// Delay before a failed executor start is retried once the pool is warm.
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Error types for pool construction.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The sizing parameters are invalid; nothing was spawned.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An executor failed to start while the pool was warming up.
    #[error("executor failed to start during warmup: {0}")]
    Startup(#[source] ExecutorError),
}

/// Error types for submitting work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The pool no longer accepts submissions.
    #[error("pool is shut down")]
    ShutDown,

    /// The submission contains no commands; it never reaches a process.
    #[error("submission contains no commands")]
    EmptySubmission,
}

/// Counters of one pool at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    /// Executor slots, in any state.
    pub total: usize,
    /// Slots still spawning their process.
    pub starting: usize,
    /// Slots with a process waiting for work.
    pub idle: usize,
    /// Slots currently executing a submission.
    pub active: usize,
    /// Submissions waiting in the queue.
    pub queued: usize,
}

/// A submission drained out of the queue by a forced shutdown.
///
/// Dropping it resolves the original caller's handle as disrupted.
pub struct PendingSubmission {
    slot: Slot,
}

impl PendingSubmission {
    /// The identifier the submission was submitted under.
    #[must_use]
    pub fn id(&self) -> SubmissionId {
        self.slot.id
    }

    /// The instructions the submission would have executed.
    #[must_use]
    pub fn instructions(&self) -> Vec<String> {
        self.slot
            .work
            .as_ref()
            .map(|work| work.instructions())
            .unwrap_or_default()
    }
}

impl fmt::Debug for PendingSubmission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingSubmission")
            .field("id", &self.slot.id)
            .finish()
    }
}

/// Pool-side view of one executor slot.
struct Seat {
    state: ExecutorState,
    interrupt: watch::Sender<Option<SubmissionId>>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    executions: u64,
}

#[derive(Default)]
struct PoolInner {
    seats: HashMap<ExecutorId, Seat>,
    running: HashMap<SubmissionId, ExecutorId>,
    shutdown: bool,
    terminated: bool,
    warmed: bool,
    startup_error: Option<ExecutorError>,
}

impl PoolInner {
    fn count(&self, state: ExecutorState) -> usize {
        self.seats
            .values()
            .filter(|seat| seat.state == state)
            .count()
    }
}

pub(crate) struct PoolCore {
    factory: Box<dyn ProcessManagerFactory>,
    config: PoolConfig,
    queue: SubmissionQueue,
    inner: Mutex<PoolInner>,
    /// Bumped on every seat or lifecycle transition; waiters re-check state.
    events: watch::Sender<u64>,
}

impl PoolCore {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.events.send_modify(|version| *version += 1);
    }

    fn spawn_seat(self: &Arc<Self>) {
        let id = ExecutorId::new();
        let (interrupt_tx, interrupt_rx) = watch::channel(None);
        self.lock().seats.insert(
            id,
            Seat {
                state: ExecutorState::Starting,
                interrupt: interrupt_tx,
                pid: None,
                started_at: None,
                executions: 0,
            },
        );
        self.bump();
        debug!(executor = %id, "starting executor");
        let core = Arc::clone(self);
        tokio::spawn(run_worker(core, id, interrupt_rx));
    }

    /// Spawn executors per the sizing policy: one when nothing is idle or
    /// starting, and more until the reserve of warm executors is met, never
    /// exceeding the maximum.
    fn consider_growth(self: &Arc<Self>) {
        loop {
            {
                let inner = self.lock();
                if inner.shutdown {
                    return;
                }
                let warm = inner.count(ExecutorState::Idle) + inner.count(ExecutorState::Starting);
                if inner.seats.len() >= self.config.max_size {
                    return;
                }
                if warm != 0 && warm >= self.config.reserve_size {
                    return;
                }
            }
            self.spawn_seat();
        }
    }

    /// Retire an idle executor whose keep-alive expired, if the pool can
    /// spare it.
    fn try_retire(&self, id: ExecutorId) -> bool {
        let mut inner = self.lock();
        if inner.shutdown {
            return false;
        }
        // Seats already stopping are on their way out and no longer count
        // towards the minimum.
        let alive = inner.seats.len() - inner.count(ExecutorState::Stopping);
        let idle = inner.count(ExecutorState::Idle);
        if alive <= self.config.min_size || idle == 0 || idle - 1 < self.config.reserve_size {
            return false;
        }
        let Some(seat) = inner.seats.get_mut(&id) else {
            return false;
        };
        if !seat.state.is_idle() {
            return false;
        }
        seat.state = ExecutorState::Stopping;
        drop(inner);
        self.bump();
        true
    }

    fn mark_idle(&self, id: ExecutorId, executor: &ProcessExecutor) {
        let mut inner = self.lock();
        if let Some(seat) = inner.seats.get_mut(&id) {
            seat.state = ExecutorState::Idle;
            seat.pid = Some(executor.pid());
            seat.started_at = Some(executor.started_at());
            seat.executions = executor.execution_count();
        }
        drop(inner);
        self.bump();
    }

    fn begin_execution(&self, id: ExecutorId, submission: SubmissionId) {
        let mut inner = self.lock();
        if let Some(seat) = inner.seats.get_mut(&id) {
            seat.state = ExecutorState::Executing;
            // Clear any interrupt left over from a previous execution.
            seat.interrupt.send_replace(None);
        }
        inner.running.insert(submission, id);
        drop(inner);
        self.bump();
    }

    fn finish_execution(&self, id: ExecutorId, submission: SubmissionId, executor: &ProcessExecutor) {
        let mut inner = self.lock();
        inner.running.remove(&submission);
        if let Some(seat) = inner.seats.get_mut(&id) {
            seat.executions = executor.execution_count();
        }
        drop(inner);
        self.bump();
    }

    fn mark_stopping(&self, id: ExecutorId) {
        let mut inner = self.lock();
        if let Some(seat) = inner.seats.get_mut(&id) {
            seat.state = ExecutorState::Stopping;
        }
        drop(inner);
        self.bump();
    }

    /// Reuse the slot for a fresh process, unless the pool is shutting down
    /// with nothing left to drain.
    fn mark_restarting(&self, id: ExecutorId) -> bool {
        let mut inner = self.lock();
        if inner.shutdown && self.queue.is_empty() {
            return false;
        }
        if let Some(seat) = inner.seats.get_mut(&id) {
            seat.state = ExecutorState::Starting;
            seat.pid = None;
            seat.started_at = None;
            seat.executions = 0;
        }
        drop(inner);
        self.bump();
        true
    }

    /// Returns `true` if the worker should give up on this slot.
    fn note_start_failure(&self, error: ExecutorError) -> bool {
        let mut inner = self.lock();
        if inner.shutdown {
            return true;
        }
        if !inner.warmed {
            inner.startup_error = Some(error);
            drop(inner);
            self.bump();
            return true;
        }
        false
    }

    fn deregister(&self, id: ExecutorId) {
        let mut inner = self.lock();
        inner.seats.remove(&id);
        let newly_terminated = inner.shutdown && inner.seats.is_empty() && !inner.terminated;
        if newly_terminated {
            inner.terminated = true;
        }
        drop(inner);
        self.bump();
        if newly_terminated {
            info!("process pool terminated");
        }
    }

    /// Returns `true` on the first call.
    fn initiate_shutdown(&self) -> bool {
        let mut inner = self.lock();
        if inner.shutdown {
            return false;
        }
        inner.shutdown = true;
        drop(inner);
        self.bump();
        true
    }

    fn check_terminated(&self) {
        let mut inner = self.lock();
        let newly_terminated = inner.shutdown && inner.seats.is_empty() && !inner.terminated;
        if newly_terminated {
            inner.terminated = true;
        }
        drop(inner);
        if newly_terminated {
            self.bump();
            info!("process pool terminated");
        }
    }

    async fn wait_for_warmup(&self, target: usize) -> Result<(), ExecutorError> {
        let mut events = self.events.subscribe();
        loop {
            events.borrow_and_update();
            {
                let mut inner = self.lock();
                if let Some(error) = inner.startup_error.take() {
                    return Err(error);
                }
                if inner.count(ExecutorState::Idle) >= target {
                    inner.warmed = true;
                    return Ok(());
                }
            }
            let _ = events.changed().await;
        }
    }

    async fn wait_terminated(&self) {
        let mut events = self.events.subscribe();
        loop {
            events.borrow_and_update();
            if self.lock().terminated {
                return;
            }
            let _ = events.changed().await;
        }
    }

    /// Cancellation routing for handles; see [`SubmissionHandle::cancel`].
    pub(crate) fn cancel_submission(
        &self,
        id: SubmissionId,
        status: &StatusCell,
        may_interrupt: bool,
    ) -> bool {
        if let Some(work) = self.queue.remove(id) {
            work.fail(SubmissionError::Cancelled);
            debug!(submission = %id, "queued submission cancelled");
            return true;
        }
        let inner = self.lock();
        let Some(&executor_id) = inner.running.get(&id) else {
            return false;
        };
        if !may_interrupt {
            return false;
        }
        if !status.settle(SubmissionStatus::Cancelled) {
            return false;
        }
        if let Some(seat) = inner.seats.get(&executor_id) {
            let _ = seat.interrupt.send(Some(id));
            debug!(submission = %id, executor = %executor_id, "interrupting executing submission");
            true
        } else {
            false
        }
    }

    fn force_teardown(&self) -> Vec<Slot> {
        self.initiate_shutdown();
        let drained = self.queue.drain_and_close();
        self.check_terminated();
        drained
    }
}

impl fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolCore")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

/// Drives one executor slot: start a process, serve submissions, replace or
/// retire the process as policy dictates, stop on shutdown.
async fn run_worker(
    core: Arc<PoolCore>,
    id: ExecutorId,
    mut interrupt: watch::Receiver<Option<SubmissionId>>,
) {
    let mut manager = core.factory.new_manager();
    'lifecycle: loop {
        let mut executor = loop {
            match ProcessExecutor::start(id, manager.as_mut(), core.config.grace_period).await {
                Ok(executor) => break executor,
                Err(error) => {
                    warn!(executor = %id, %error, "executor failed to start");
                    if core.note_start_failure(error) {
                        core.deregister(id);
                        return;
                    }
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        };
        core.mark_idle(id, &executor);

        loop {
            let taken = match core.config.keep_alive {
                Some(keep_alive) => {
                    match tokio::time::timeout(keep_alive, core.queue.take()).await {
                        Ok(taken) => taken,
                        Err(_) => {
                            if core.try_retire(id) {
                                debug!(executor = %id, "idle keep-alive expired; retiring");
                                executor.stop(manager.as_mut(), false).await;
                                core.deregister(id);
                                return;
                            }
                            continue;
                        }
                    }
                }
                None => core.queue.take().await,
            };
            let Some(slot) = taken else {
                // Queue closed: the pool is shutting down.
                core.mark_stopping(id);
                executor.stop(manager.as_mut(), false).await;
                core.deregister(id);
                return;
            };

            let submission_id = slot.id;
            core.begin_execution(id, submission_id);
            let disposition = executor.execute(slot, &mut interrupt).await;
            core.finish_execution(id, submission_id, &executor);

            let disposition = match disposition {
                Disposition::Retain
                    if !manager
                        .should_retain(executor.execution_count(), executor.total_runtime()) =>
                {
                    debug!(executor = %id, "manager declined to retain process; recycling");
                    Disposition::Replace { forcibly: false }
                }
                other => other,
            };

            match disposition {
                Disposition::Retain => core.mark_idle(id, &executor),
                Disposition::Replace { forcibly } => {
                    core.mark_stopping(id);
                    executor.stop(manager.as_mut(), forcibly).await;
                    if core.mark_restarting(id) {
                        continue 'lifecycle;
                    }
                    core.deregister(id);
                    return;
                }
            }
        }
    }
}

/// A dynamically sized pool of process executors.
///
/// Constructed against a [`ProcessManagerFactory`] that supplies one
/// [`ProcessManager`](crate::manager::ProcessManager) per executor slot.
/// Construction blocks until the initial executors are idle.
pub struct ProcessPool {
    core: Arc<PoolCore>,
}

impl ProcessPool {
    /// Create a pool with the given configuration.
    ///
    /// The initial size is the greater of the minimum and the reserve;
    /// this method returns once that many executors are idle.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Config`] for invalid sizing parameters, before
    /// any process is spawned, and [`PoolError::Startup`] if an executor
    /// fails to start during warmup.
    pub async fn new<F>(factory: F, config: PoolConfig) -> Result<Self, PoolError>
    where
        F: ProcessManagerFactory + 'static,
    {
        config.validate()?;
        let core = Arc::new(PoolCore {
            factory: Box::new(factory),
            queue: SubmissionQueue::new(),
            inner: Mutex::new(PoolInner::default()),
            events: watch::channel(0).0,
            config,
        });

        let initial = core.config.initial_size();
        for _ in 0..initial {
            core.spawn_seat();
        }
        if let Err(error) = core.wait_for_warmup(initial).await {
            drop(core.force_teardown());
            return Err(PoolError::Startup(error));
        }
        info!(
            min = core.config.min_size,
            max = core.config.max_size,
            reserve = core.config.reserve_size,
            initial,
            "process pool started"
        );
        Ok(Self { core })
    }

    /// A fixed-size pool: minimum and maximum both `size`, no reserve.
    ///
    /// # Errors
    ///
    /// See [`ProcessPool::new`].
    pub async fn fixed<F>(factory: F, size: usize) -> Result<Self, PoolError>
    where
        F: ProcessManagerFactory + 'static,
    {
        Self::new(factory, PoolConfig::new(size, size, 0)).await
    }

    /// A fixed-size pool holding a single process.
    ///
    /// # Errors
    ///
    /// See [`ProcessPool::new`].
    pub async fn single<F>(factory: F) -> Result<Self, PoolError>
    where
        F: ProcessManagerFactory + 'static,
    {
        Self::fixed(factory, 1).await
    }

    /// A pool that grows as required and retires idle executors after the
    /// keep-alive interval.
    ///
    /// # Errors
    ///
    /// See [`ProcessPool::new`].
    pub async fn cached<F>(factory: F) -> Result<Self, PoolError>
    where
        F: ProcessManagerFactory + 'static,
    {
        Self::new(factory, PoolConfig::new(0, usize::MAX, 0)).await
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.core.config
    }

    /// Submit work for execution and return its handle.
    ///
    /// Does not block until the submission is processed. If an executor is
    /// idle it picks the submission up immediately; otherwise the submission
    /// waits in FIFO order, and the pool grows if the sizing policy allows.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::ShutDown`] after shutdown was initiated and
    /// [`SubmitError::EmptySubmission`] for submissions with no commands.
    pub fn submit<T: Send + 'static>(
        &self,
        submission: Submission<T>,
    ) -> Result<SubmissionHandle<T>, SubmitError> {
        if submission.commands().is_empty() {
            return Err(SubmitError::EmptySubmission);
        }
        if self.core.lock().shutdown {
            return Err(SubmitError::ShutDown);
        }

        let id = SubmissionId::next();
        let status = StatusCell::new();
        let (tx, rx) = oneshot::channel();
        let work = Box::new(TypedSubmission::new(submission, Arc::clone(&status), tx));
        if self.core.queue.push(Slot::new(id, work)).is_err() {
            return Err(SubmitError::ShutDown);
        }
        debug!(submission = %id, "submission enqueued");
        self.core.consider_growth();
        Ok(SubmissionHandle::new(
            id,
            Arc::downgrade(&self.core),
            status,
            rx,
        ))
    }

    /// Initiate an orderly shutdown: no new submissions are accepted, the
    /// queue drains, and executors stop as they go idle. Idempotent.
    pub fn shutdown(&self) {
        if self.core.initiate_shutdown() {
            info!("orderly pool shutdown initiated");
        }
        self.core.queue.shutdown();
        self.core.check_terminated();
    }

    /// Initiate a forced shutdown: additionally drain the queue, returning
    /// the submissions that were still waiting. Running submissions are left
    /// to finish. Idempotent; later calls return an empty list.
    pub fn force_shutdown(&self) -> Vec<PendingSubmission> {
        let first = self.core.initiate_shutdown();
        let drained = self.core.force_teardown();
        if first {
            info!(returned = drained.len(), "forced pool shutdown initiated");
        }
        drained
            .into_iter()
            .map(|slot| PendingSubmission { slot })
            .collect()
    }

    /// Whether shutdown has been initiated.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.core.lock().shutdown
    }

    /// Whether the pool has shut down with every executor stopped.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.core.lock().terminated
    }

    /// Wait up to `timeout` for the pool to terminate.
    ///
    /// Returns whether the pool terminated within the timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.core.wait_terminated())
            .await
            .is_ok()
    }

    /// Current counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.core.lock();
        PoolSnapshot {
            total: inner.seats.len(),
            starting: inner.count(ExecutorState::Starting),
            idle: inner.count(ExecutorState::Idle),
            active: inner.count(ExecutorState::Executing),
            queued: self.core.queue.len(),
        }
    }

    /// Per-executor observability records.
    #[must_use]
    pub fn executors(&self) -> Vec<ExecutorSnapshot> {
        self.core
            .lock()
            .seats
            .iter()
            .map(|(id, seat)| ExecutorSnapshot {
                id: *id,
                state: seat.state,
                pid: seat.pid,
                started_at: seat.started_at,
                executions: seat.executions,
            })
            .collect()
    }
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.core.config)
            .finish()
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            debug!("process pool dropped without shutdown; forcing");
            drop(self.force_shutdown());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ProcessManager, ProcessSpec, SimpleProcessManager};

    fn shell_factory() -> impl ProcessManagerFactory + 'static {
        || -> Box<dyn ProcessManager> {
            Box::new(SimpleProcessManager::new(ProcessSpec::new("/bin/sh")))
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_spawning() {
        let result = ProcessPool::new(shell_factory(), PoolConfig::new(4, 2, 0)).await;
        assert!(matches!(
            result,
            Err(PoolError::Config(ConfigError::MinAboveMax { min: 4, max: 2 }))
        ));
    }

    #[tokio::test]
    async fn test_warmup_failure_surfaces_as_startup_error() {
        let broken = || -> Box<dyn ProcessManager> {
            Box::new(SimpleProcessManager::new(ProcessSpec::new(
                "nonexistent_command_12345",
            )))
        };
        let result = ProcessPool::new(broken, PoolConfig::new(1, 2, 0)).await;
        assert!(matches!(result, Err(PoolError::Startup(_))));
    }

    #[cfg_attr(miri, ignore)] // Miri can't spawn processes
    #[tokio::test]
    async fn test_warmup_reaches_the_initial_size() {
        let pool = ProcessPool::new(shell_factory(), PoolConfig::new(2, 4, 1))
            .await
            .unwrap();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.total, 2);
        assert_eq!(snapshot.idle, 2);
        assert_eq!(snapshot.active, 0);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_pool_snapshot_serialization() {
        let snapshot = PoolSnapshot {
            total: 3,
            starting: 1,
            idle: 1,
            active: 1,
            queued: 2,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: PoolSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }
}
