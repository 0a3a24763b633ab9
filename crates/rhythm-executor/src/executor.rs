//! `JobExecutor`: runs job argument vectors as child processes.
//!
//! Each job gets its own process group so that a timeout can kill the whole
//! tree (the build tool typically forks workers) rather than just the leader.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhythm_core::config::ExecutorConfig;
use rhythm_core::redact::redact;
use rhythm_core::{FailureKind, JobSpec, Outcome};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{ExecError, Result},
    truncate::{tail_chars, TailBuffer, DETAIL_TAIL_CHARS},
    types::{ExecReport, JobRunner},
};

/// How long to wait for pipe readers once the process has exited.  A
/// grandchild that escaped the group can hold a pipe open indefinitely.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Spawns jobs directly from their argv; no shell is ever involved.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    max_output_bytes: usize,
    working_dir: Option<String>,
}

enum Exit {
    Finished(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled(std::io::Result<ExitStatus>),
}

impl JobExecutor {
    pub fn new(cfg: &ExecutorConfig) -> Self {
        Self {
            max_output_bytes: cfg.max_output_bytes,
            working_dir: cfg.working_dir.clone(),
        }
    }

    fn spawn(&self, spec: &JobSpec) -> Result<Child> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| ExecError::EmptyCommand {
                class: spec.class.to_string(),
            })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd.spawn()?)
    }

    async fn execute(&self, spec: &JobSpec, cancel: CancellationToken) -> ExecReport {
        let started = Instant::now();
        let mut child = match self.spawn(spec) {
            Ok(child) => child,
            Err(e) => {
                return ExecReport::not_started(Outcome::Failure(FailureKind::Spawn {
                    reason: redact(&e.to_string()),
                }))
            }
        };
        let pid = child.id();

        let stdout = spawn_reader(child.stdout.take(), self.max_output_bytes);
        let stderr = spawn_reader(child.stderr.take(), self.max_output_bytes);

        let deadline = tokio::time::sleep(spec.timeout);
        tokio::pin!(deadline);

        let exit = tokio::select! {
            status = child.wait() => Exit::Finished(status),
            _ = &mut deadline => {
                kill_group(pid, Signal::Kill);
                let _ = child.wait().await;
                Exit::TimedOut
            }
            _ = cancel.cancelled() => {
                // Cooperative until the job's own timeout, forced after that.
                kill_group(pid, Signal::Term);
                tokio::select! {
                    status = child.wait() => Exit::Cancelled(status),
                    _ = &mut deadline => {
                        kill_group(pid, Signal::Kill);
                        Exit::Cancelled(child.wait().await)
                    }
                }
            }
        };

        let stdout_tail = redact(&collect(stdout).await);
        let stderr_tail = redact(&collect(stderr).await);
        let duration = started.elapsed();

        let (outcome, exit_code) = classify(exit, &stderr_tail);
        ExecReport {
            outcome,
            exit_code,
            stdout_tail,
            stderr_tail,
            duration,
        }
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(&self, spec: &JobSpec, cancel: CancellationToken) -> ExecReport {
        debug!(class = %spec.class, argv = ?rhythm_core::redact::redact_argv(&spec.command), "spawning job");
        let report = self.execute(spec, cancel).await;

        let ms = report.duration.as_millis() as u64;
        match &report.outcome {
            Outcome::Success => info!(
                class = %spec.class,
                duration_ms = ms,
                exit_code = ?report.exit_code,
                outcome = "success",
                "job finished"
            ),
            Outcome::Timeout => warn!(
                class = %spec.class,
                duration_ms = ms,
                timeout_ms = spec.timeout.as_millis() as u64,
                outcome = "timeout",
                "job timed out, process group killed"
            ),
            Outcome::Failure(kind) => warn!(
                class = %spec.class,
                duration_ms = ms,
                exit_code = ?report.exit_code,
                outcome = "failure",
                detail = %kind.detail(),
                "job failed"
            ),
        }
        report
    }
}

fn classify(exit: Exit, stderr_tail: &str) -> (Outcome, Option<i32>) {
    let detail_tail = || tail_chars(stderr_tail, DETAIL_TAIL_CHARS);
    match exit {
        Exit::TimedOut => (Outcome::Timeout, None),
        Exit::Finished(Err(e)) => (
            Outcome::Failure(FailureKind::Spawn {
                reason: format!("wait failed: {e}"),
            }),
            None,
        ),
        Exit::Finished(Ok(status)) if status.success() => (Outcome::Success, Some(0)),
        Exit::Finished(Ok(status)) => match status.code() {
            Some(code) => (
                Outcome::Failure(FailureKind::NonZeroExit {
                    code,
                    stderr_tail: detail_tail(),
                }),
                Some(code),
            ),
            None => (
                Outcome::Failure(FailureKind::Signaled {
                    stderr_tail: detail_tail(),
                }),
                None,
            ),
        },
        // A job that still finished cleanly after SIGTERM did its work.
        Exit::Cancelled(Ok(status)) if status.success() => (Outcome::Success, Some(0)),
        Exit::Cancelled(status) => (
            Outcome::Failure(FailureKind::Cancelled),
            status.ok().and_then(|s| s.code()),
        ),
    }
}

fn spawn_reader<R>(pipe: Option<R>, cap: usize) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut pipe = pipe?;
    Some(tokio::spawn(async move {
        let mut tail = TailBuffer::new(cap);
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => tail.push(&chunk[..n]),
            }
        }
        tail.into_text()
    }))
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            handle.abort();
            warn!("output pipe still open after exit, capture abandoned");
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal every process in the job's group.
fn kill_group(pid: Option<u32>, signal: Signal) {
    let Some(raw_pid) = pid else { return };
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Safety: the child was spawned with process_group(0), so its pid is
        // also the group id; a negative pid addresses the whole group.
        let rc = unsafe { libc::kill(-(raw_pid as libc::pid_t), sig) };
        if rc != 0 {
            debug!(pid = raw_pid, ?signal, "kill(2) on process group failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &raw_pid.to_string()])
            .output();
    }
}
