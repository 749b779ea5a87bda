// SPDX-License-Identifier: MIT OR Apache-2.0
//! The user task executor seam.
//!
//! The executor daemon runs whatever [`TaskExecutor`] it was built with;
//! the protocol engine neither knows nor cares what the task does, only
//! that it returns an outcome or an error and respects cancellation.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::path::PathBuf;
use uuid::Uuid;

use awcp_core::{ResourceManifestEntry, TaskSpec};

use crate::cancel::CancellationToken;

/// Everything a task gets to see.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The delegation this task belongs to.
    pub delegation_id: Uuid,
    /// Effective work directory with the materialized environment.
    pub work_path: PathBuf,
    /// Task descriptor from the INVITE.
    pub task: TaskSpec,
    /// The resources offered (names and modes; no delegator paths).
    pub resources: Vec<ResourceManifestEntry>,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
}

/// Successful task outcome.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    /// Human summary of what the task did.
    pub summary: String,
    /// Notable items, in emphasis order.
    pub highlights: Vec<String>,
}

/// Task failure, surfaced as a `TASK_FAILED` error event.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    /// Human-readable failure description.
    pub message: String,
    /// Optional remediation hint.
    pub hint: Option<String>,
}

impl TaskError {
    /// Create a failure with no hint.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a remediation hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// The user-provided plug-in that actually performs delegated work.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task to completion (or until cancelled).
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError>;
}

/// Wraps a closure as a [`TaskExecutor`]; the daemon's built-in executor
/// and most tests use this.
pub struct FnTaskExecutor<F>(F);

impl<F> FnTaskExecutor<F>
where
    F: Fn(TaskContext) -> BoxFuture<'static, Result<TaskOutcome, TaskError>> + Send + Sync,
{
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> TaskExecutor for FnTaskExecutor<F>
where
    F: Fn(TaskContext) -> BoxFuture<'static, Result<TaskOutcome, TaskError>> + Send + Sync,
{
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        (self.0)(ctx).await
    }
}

/// Built-in no-op executor: acknowledges the prompt without touching the
/// workspace. Deployments replace this with a real agent integration.
pub struct AckTaskExecutor;

#[async_trait]
impl TaskExecutor for AckTaskExecutor {
    async fn execute(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        Ok(TaskOutcome {
            summary: format!("acknowledged task: {}", ctx.task.description),
            highlights: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TaskContext {
        TaskContext {
            delegation_id: Uuid::new_v4(),
            work_path: PathBuf::from("/tmp/w"),
            task: TaskSpec {
                description: "say hi".into(),
                prompt: "hi".into(),
            },
            resources: vec![],
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn ack_executor_reports_the_description() {
        let outcome = AckTaskExecutor.execute(ctx()).await.unwrap();
        assert!(outcome.summary.contains("say hi"));
    }

    #[tokio::test]
    async fn fn_executor_runs_the_closure() {
        let executor = FnTaskExecutor::new(|ctx: TaskContext| {
            Box::pin(async move {
                Ok(TaskOutcome {
                    summary: format!("ran {}", ctx.task.prompt),
                    highlights: vec!["one".into()],
                })
            }) as futures::future::BoxFuture<'static, Result<TaskOutcome, TaskError>>
        });
        let outcome = executor.execute(ctx()).await.unwrap();
        assert_eq!(outcome.summary, "ran hi");
    }

    #[test]
    fn task_error_carries_hint() {
        let err = TaskError::new("exit 2").with_hint("see logs");
        assert_eq!(err.to_string(), "exit 2");
        assert_eq!(err.hint.as_deref(), Some("see logs"));
    }
}
