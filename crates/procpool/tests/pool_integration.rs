//! End-to-end pool behaviour against real `/bin/sh` child processes.
//!
//! The shell reads commands line by line from stdin, which makes it a
//! convenient executor: `echo` produces completion sentinels on stdout and
//! redirection produces stderr traffic on demand.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use procpool::{
    Command, InvokeAnyError, PoolConfig, ProcessManager, ProcessPool, ProcessSpec,
    SimpleProcessManager, Submission, SubmissionError, SubmitError,
};

fn shell_factory() -> impl procpool::ProcessManagerFactory + 'static {
    || -> Box<dyn ProcessManager> {
        Box::new(SimpleProcessManager::new(ProcessSpec::new("/bin/sh")))
    }
}

/// A submission running one shell command and completing on an echoed
/// sentinel.
fn shell_submission(script: &str) -> Submission<()> {
    let instruction = format!("{script}; echo __done__");
    Submission::builder()
        .command(Command::expecting_output(instruction, |_, line| {
            Ok(line == "__done__")
        }))
        .build()
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn submission_captures_stdout_until_the_sentinel() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let captured = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let lines = Arc::clone(&captured);
    let submission = Submission::builder()
        .command(Command::expecting_output(
            "printf 'loading\\nready\\n'",
            move |command, line| {
                if line == "ready" {
                    sink.lock()
                        .unwrap()
                        .extend_from_slice(command.stdout_lines());
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
        ))
        .result(move || lines.lock().unwrap().clone())
        .build();

    let handle = pool.submit(submission).unwrap();
    let output = handle.wait().await.unwrap();
    assert_eq!(output, ["loading", "ready"]);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn stderr_output_fails_the_submission_and_replaces_the_process() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let pids = Arc::new(Mutex::new(Vec::new()));

    let observed = Arc::clone(&pids);
    let failing = Submission::builder()
        .command(Command::expecting_output("echo WARN >&2", |_, _| Ok(false)))
        .on_start(move |pid| observed.lock().unwrap().push(pid))
        .build();
    let error = pool.submit(failing).unwrap().wait().await.unwrap_err();
    match error {
        SubmissionError::CommandFailed { line, .. } => assert_eq!(line, "WARN"),
        other => panic!("expected a failed command, got {other:?}"),
    }

    // The replacement process serves subsequent submissions.
    let observed = Arc::clone(&pids);
    let follow_up = Submission::builder()
        .command(Command::expecting_output("echo ok", |_, line| {
            Ok(line == "ok")
        }))
        .on_start(move |pid| observed.lock().unwrap().push(pid))
        .build();
    pool.submit(follow_up).unwrap().wait().await.unwrap();

    let pids = pids.lock().unwrap();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[0], pids[1]);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn commands_execute_in_order_on_one_process() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let output = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&output);
    let second = Arc::clone(&output);
    let submission = Submission::builder()
        .command(Command::expecting_output("echo alpha", move |_, line| {
            first.lock().unwrap().push(line.to_owned());
            Ok(line == "alpha")
        }))
        .command(Command::expecting_output("echo beta", move |_, line| {
            second.lock().unwrap().push(line.to_owned());
            Ok(line == "beta")
        }))
        .build();

    pool.submit(submission).unwrap().wait().await.unwrap();
    assert_eq!(*output.lock().unwrap(), ["alpha", "beta"]);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn cancelling_a_running_submission_interrupts_and_recovers() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let stuck = Submission::builder()
        .command(Command::expecting_output("sleep 30", |_, _| Ok(false)))
        .build();
    let handle = pool.submit(stuck).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.cancel(true));
    assert!(handle.is_cancelled());
    // Cancellation is idempotent: the second call reports failure.
    assert!(!handle.cancel(true));
    assert!(matches!(
        handle.wait().await,
        Err(SubmissionError::Cancelled)
    ));

    // A fresh process picks up subsequent work.
    pool.submit(shell_submission("true"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn cancelling_a_queued_submission_removes_it_without_execution() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let blocker = pool.submit(shell_submission("sleep 0.4")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = pool.submit(shell_submission("echo never")).unwrap();

    assert!(queued.cancel(false));
    assert!(matches!(
        queued.wait().await,
        Err(SubmissionError::Cancelled)
    ));

    blocker.wait().await.unwrap();
    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn executing_submissions_refuse_cancellation_without_interrupt() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let handle = pool.submit(shell_submission("sleep 0.3")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!handle.cancel(false));
    handle.wait().await.unwrap();

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn pool_grows_under_load_and_shrinks_after_keep_alive() {
    let config = PoolConfig::new(2, 4, 1).with_keep_alive(Some(Duration::from_millis(300)));
    let pool = ProcessPool::new(shell_factory(), config).await.unwrap();
    assert_eq!(pool.snapshot().total, 2);

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(pool.submit(shell_submission("sleep 0.2")).unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    let grown = pool.snapshot().total;
    assert!(grown >= 3, "expected growth beyond the minimum, got {grown}");
    assert!(grown <= 4, "growth must respect the maximum, got {grown}");

    for handle in handles {
        handle.wait().await.unwrap();
    }

    // Idle executors above the minimum retire once their keep-alive expires.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(pool.snapshot().total, 2);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn fixed_pool_keeps_a_constant_size() {
    let config = PoolConfig::new(2, 2, 0).with_keep_alive(Some(Duration::from_millis(100)));
    let pool = ProcessPool::new(shell_factory(), config).await.unwrap();

    for _ in 0..4 {
        pool.submit(shell_submission("true"))
            .unwrap()
            .wait()
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(pool.snapshot().total, 2);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn terminate_after_replaces_the_process() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let pids = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let observed = Arc::clone(&pids);
        let submission = Submission::builder()
            .command(Command::expecting_output("echo ok", |_, line| {
                Ok(line == "ok")
            }))
            .on_start(move |pid| observed.lock().unwrap().push(pid))
            .terminate_after(true)
            .build();
        pool.submit(submission).unwrap().wait().await.unwrap();
    }

    let pids = pids.lock().unwrap();
    assert_eq!(pids.len(), 2);
    assert_ne!(pids[0], pids[1]);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn manager_recycling_limit_replaces_the_process() {
    let factory = || -> Box<dyn ProcessManager> {
        Box::new(SimpleProcessManager::new(ProcessSpec::new("/bin/sh")).with_max_executions(1))
    };
    let pool = ProcessPool::single(factory).await.unwrap();

    let pids = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let observed = Arc::clone(&pids);
        let submission = Submission::builder()
            .command(Command::expecting_output("echo ok", |_, line| {
                Ok(line == "ok")
            }))
            .on_start(move |pid| observed.lock().unwrap().push(pid))
            .build();
        pool.submit(submission).unwrap().wait().await.unwrap();
    }

    let pids = pids.lock().unwrap();
    assert_ne!(pids[0], pids[1]);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn startup_and_termination_submissions_bracket_the_process() {
    let events = Arc::new(Mutex::new(Vec::new()));

    let factory = {
        let events = Arc::clone(&events);
        move || -> Box<dyn ProcessManager> {
            let on_boot = Arc::clone(&events);
            let on_exit = Arc::clone(&events);
            Box::new(
                SimpleProcessManager::new(ProcessSpec::new("/bin/sh"))
                    .with_startup(move || {
                        let log = Arc::clone(&on_boot);
                        Submission::builder()
                            .command(Command::expecting_output("echo booted", |_, line| {
                                Ok(line == "booted")
                            }))
                            .on_finish(move || log.lock().unwrap().push("startup"))
                            .build()
                    })
                    .with_termination(move || {
                        let log = Arc::clone(&on_exit);
                        Submission::builder()
                            .command(Command::new("exit 0"))
                            .on_finish(move || log.lock().unwrap().push("termination"))
                            .build()
                    }),
            )
        }
    };

    let pool = ProcessPool::single(factory).await.unwrap();
    assert_eq!(*events.lock().unwrap(), ["startup"]);

    pool.submit(shell_submission("true"))
        .unwrap()
        .wait()
        .await
        .unwrap();

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
    assert_eq!(*events.lock().unwrap(), ["startup", "termination"]);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn invoke_all_cancels_what_the_budget_cannot_cover() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let submissions = vec![
        shell_submission("true"),
        shell_submission("sleep 0.5"),
        shell_submission("true"),
    ];
    let outcome = pool
        .invoke_all(submissions, Duration::from_millis(200))
        .await
        .unwrap();

    assert!(outcome.timed_out);
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results[0].is_ok());
    assert!(matches!(
        outcome.results[1],
        Err(SubmissionError::Cancelled)
    ));
    assert!(matches!(
        outcome.results[2],
        Err(SubmissionError::Cancelled)
    ));

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn invoke_all_within_budget_returns_every_result() {
    let pool = ProcessPool::fixed(shell_factory(), 2).await.unwrap();

    let submissions = vec![shell_submission("true"), shell_submission("true")];
    let outcome = pool
        .invoke_all(submissions, Duration::from_secs(5))
        .await
        .unwrap();

    assert!(!outcome.timed_out);
    assert!(outcome.results.iter().all(Result::is_ok));

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn invoke_any_returns_the_first_success() {
    let pool = ProcessPool::fixed(shell_factory(), 2).await.unwrap();

    let quick = Submission::builder()
        .command(Command::expecting_output("echo fast", |_, line| {
            Ok(line == "fast")
        }))
        .result(|| "fast")
        .build();
    let slow = Submission::builder()
        .command(Command::expecting_output("sleep 5; echo slow", |_, line| {
            Ok(line == "slow")
        }))
        .result(|| "slow")
        .build();

    let winner = pool
        .invoke_any(vec![slow, quick], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(winner, "fast");

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(10)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn invoke_any_reports_timeout_when_nothing_succeeds() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let stuck = Submission::builder()
        .command(Command::expecting_output("sleep 30", |_, _| Ok(false)))
        .build();
    let error = pool
        .invoke_any(vec![stuck], Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(error, InvokeAnyError::Timeout { .. }));

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn shutdown_rejects_new_submissions_and_is_idempotent() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    pool.shutdown();
    pool.shutdown();
    assert!(pool.is_shutdown());

    let rejected = pool.submit(shell_submission("true")).unwrap_err();
    assert_eq!(rejected, SubmitError::ShutDown);

    assert!(pool.await_termination(Duration::from_secs(5)).await);
    assert!(pool.is_terminated());
    assert!(pool.force_shutdown().is_empty());
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn orderly_shutdown_drains_queued_submissions() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let running = pool.submit(shell_submission("sleep 0.3")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let queued = pool.submit(shell_submission("true")).unwrap();

    pool.shutdown();

    running.wait().await.unwrap();
    queued.wait().await.unwrap();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn force_shutdown_returns_the_waiting_submissions() {
    let pool = ProcessPool::single(shell_factory()).await.unwrap();

    let running = pool.submit(shell_submission("sleep 0.3")).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut queued = Vec::new();
    for _ in 0..5 {
        queued.push(pool.submit(shell_submission("true")).unwrap());
    }

    let pending = pool.force_shutdown();
    assert_eq!(pending.len(), 5);
    assert_eq!(pending[0].instructions().len(), 1);

    // The running submission is left to finish.
    running.wait().await.unwrap();
    assert!(pool.await_termination(Duration::from_secs(5)).await);

    // Dropping the returned submissions resolves their handles.
    drop(pending);
    for handle in queued {
        assert!(matches!(
            handle.wait().await,
            Err(SubmissionError::Disrupted { .. })
        ));
    }
}

#[cfg_attr(miri, ignore)]
#[tokio::test]
async fn cached_pool_starts_empty_and_retires_after_use() {
    let factory = shell_factory();
    let config = PoolConfig::new(0, usize::MAX, 0)
        .with_keep_alive(Some(Duration::from_millis(200)));
    let pool = ProcessPool::new(factory, config).await.unwrap();
    assert_eq!(pool.snapshot().total, 0);

    pool.submit(shell_submission("true"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(pool.snapshot().total >= 1);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(pool.snapshot().total, 0);

    pool.shutdown();
    assert!(pool.await_termination(Duration::from_secs(5)).await);
}
