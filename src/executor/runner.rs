//! The injected task runner contract and its built-in implementations.
//!
//! The protocol engine treats the runner as a single function from a
//! materialized work path and task description to a summary. Progress flows
//! back through a write-only [`StatusSink`]; the runner never sees the
//! engine or the event bus directly.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::delegation::TaskSpec;
use crate::models::resource::Resource;
use crate::protocol::events::DelegationEvent;
use crate::{AwcpError, Result};

use super::bus::EventBus;

/// Environment variables inherited by a spawned task process.
///
/// Everything else is stripped via `env_clear()` so executor secrets never
/// leak into the task's environment.
const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "RUST_LOG", "TEMP", "TMP", "USERPROFILE"];

/// What the engine hands to the runner.
#[derive(Debug, Clone)]
pub struct TaskInput {
    /// Delegation this run belongs to.
    pub delegation_id: String,
    /// Materialized work path the task operates on.
    pub work_path: PathBuf,
    /// The work to perform.
    pub task: TaskSpec,
    /// Declared environment, for runners that care about modes.
    pub environment: Vec<Resource>,
}

/// What the runner returns on success; becomes the `done` event body.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Summary of the work performed.
    pub summary: String,
    /// Optional notable outcomes.
    pub highlights: Option<Vec<String>>,
}

/// Write-only progress channel handed to the runner.
///
/// Emitting never blocks the runner; failures to deliver are logged and
/// swallowed so a dropped subscriber cannot fail the task.
#[derive(Clone)]
pub struct StatusSink {
    bus: Arc<EventBus>,
    delegation_id: String,
}

impl StatusSink {
    /// Build a sink bound to one delegation's event channel.
    #[must_use]
    pub fn new(bus: Arc<EventBus>, delegation_id: impl Into<String>) -> Self {
        Self {
            bus,
            delegation_id: delegation_id.into(),
        }
    }

    /// Emit an informational status event.
    pub fn status(&self, message: impl Into<String>) {
        let event = DelegationEvent::status(message, None);
        if let Err(err) = self.bus.publish(&self.delegation_id, event) {
            warn!(delegation_id = %self.delegation_id, %err, "status event dropped");
        }
    }
}

/// The injected task execution contract.
///
/// Cancellation is cooperative: implementations should observe `cancel`
/// and return promptly once it fires; the engine waits a small grace
/// period before releasing resources regardless.
pub trait TaskRunner: Send + Sync {
    /// Run the task against the materialized work path.
    fn run<'a>(
        &'a self,
        input: TaskInput,
        sink: StatusSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>>;
}

/// Closure-backed runner used by tests and embedders.
pub struct FnTaskRunner<F> {
    f: F,
}

impl<F> FnTaskRunner<F>
where
    F: Fn(TaskInput, StatusSink) -> Result<TaskOutcome> + Send + Sync,
{
    /// Wrap a synchronous closure as a runner.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TaskRunner for FnTaskRunner<F>
where
    F: Fn(TaskInput, StatusSink) -> Result<TaskOutcome> + Send + Sync,
{
    fn run<'a>(
        &'a self,
        input: TaskInput,
        sink: StatusSink,
        _cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>> {
        let outcome = (self.f)(input, sink);
        Box::pin(async move { outcome })
    }
}

/// Default runner when no command is configured: acknowledges the task
/// without touching the work path.
pub struct LoggingTaskRunner;

impl TaskRunner for LoggingTaskRunner {
    fn run<'a>(
        &'a self,
        input: TaskInput,
        sink: StatusSink,
        _cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                delegation_id = %input.delegation_id,
                description = %input.task.description,
                "no task command configured; acknowledging task"
            );
            sink.status("task acknowledged without execution");
            Ok(TaskOutcome {
                summary: format!("acknowledged: {}", input.task.description),
                highlights: None,
            })
        })
    }
}

/// Runs a configured command in the work path.
///
/// The child inherits only a safe environment allowlist plus
/// `AWCP_DELEGATION_ID` and `AWCP_TASK_PROMPT`, runs with the work path as
/// its working directory, and is killed on cancellation.
pub struct CommandTaskRunner {
    program: String,
    args: Vec<String>,
}

impl CommandTaskRunner {
    /// Build a runner from a non-empty command line.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if `command` is empty.
    pub fn new(command: &[String]) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            return Err(AwcpError::Config("task_command must not be empty".into()));
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl TaskRunner for CommandTaskRunner {
    fn run<'a>(
        &'a self,
        input: TaskInput,
        sink: StatusSink,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<TaskOutcome>> + Send + 'a>> {
        Box::pin(async move {
            let mut cmd = Command::new(&self.program);
            cmd.args(&self.args);

            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
            cmd.env("AWCP_DELEGATION_ID", &input.delegation_id);
            cmd.env("AWCP_TASK_PROMPT", &input.task.prompt);

            cmd.current_dir(&input.work_path)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .kill_on_drop(true);

            sink.status(format!("running task command '{}'", self.program));

            let child = cmd
                .spawn()
                .map_err(|err| AwcpError::protocol(
                    crate::ErrorCode::TaskFailed,
                    format!("failed to spawn task command: {err}"),
                ))?;

            let output = tokio::select! {
                result = child.wait_with_output() => result.map_err(|err| {
                    AwcpError::protocol(
                        crate::ErrorCode::TaskFailed,
                        format!("task command wait failed: {err}"),
                    )
                })?,
                () = cancel.cancelled() => {
                    // kill_on_drop reaps the child when we bail out here.
                    return Err(AwcpError::protocol(
                        crate::ErrorCode::Cancelled,
                        "task command cancelled",
                    ));
                }
            };

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: String = stderr.chars().rev().take(400).collect::<Vec<_>>()
                    .into_iter().rev().collect();
                return Err(AwcpError::protocol(
                    crate::ErrorCode::TaskFailed,
                    format!(
                        "task command exited with {}: {tail}",
                        output
                            .status
                            .code()
                            .map_or_else(|| "signal".to_owned(), |c| c.to_string())
                    ),
                ));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let summary = stdout
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("task command completed")
                .to_owned();

            Ok(TaskOutcome {
                summary,
                highlights: None,
            })
        })
    }
}

/// Grace period the engine waits for a cancelled runner to wind down.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);
