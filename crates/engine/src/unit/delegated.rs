use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ExecutionStrategy, ExecutionUnit, UnitOutcome, UnitStreams};
use crate::config::{DEFAULT_POLL_INTERVAL_MS, DEFAULT_SETUP_TIMEOUT_SECONDS};
use crate::error::{Result, UnitError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Buffered result reported by a backend once a task is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            stdout: None,
            stderr: None,
            exit_code: None,
            error: Some(error.into()),
        }
    }
}

impl From<TaskResult> for UnitOutcome {
    fn from(result: TaskResult) -> Self {
        let TaskResult {
            status,
            stdout,
            stderr,
            exit_code,
            error,
        } = result;
        match status {
            TaskStatus::Success => UnitOutcome {
                exit_code: exit_code.or(Some(0)),
                stdout,
                stderr,
                failure: None,
            },
            TaskStatus::Error => UnitOutcome {
                exit_code,
                stdout,
                failure: Some(
                    error
                        .or_else(|| stderr.clone())
                        .unwrap_or_else(|| "execution failed".to_owned()),
                ),
                stderr,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready(TaskResult),
    Revoked,
}

/// Remote executor that accepts code and reports a buffered result later.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str {
        "backend"
    }

    async fn submit(&self, code: &str) -> Result<TaskId>;

    async fn poll(&self, task: &TaskId) -> Result<TaskState>;

    /// `graceful` asks the backend to interrupt the task; otherwise the task
    /// is killed outright.
    async fn revoke(&self, task: &TaskId, graceful: bool) -> Result<()>;

    /// Resolves when `task` may have changed state. Backends that can notify
    /// override this; the default waits one poll interval.
    async fn wait_ready(&self, _task: &TaskId, poll_interval: Duration) {
        tokio::time::sleep(poll_interval).await;
    }
}

pub struct DelegatedStrategy {
    backend: Arc<dyn ExecutionBackend>,
    poll_interval: Duration,
    setup_timeout: Duration,
}

impl DelegatedStrategy {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            setup_timeout: Duration::from_secs(DEFAULT_SETUP_TIMEOUT_SECONDS),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }
}

#[async_trait]
impl ExecutionStrategy for DelegatedStrategy {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn start(&self, code: &str) -> Result<Box<dyn ExecutionUnit>> {
        let task = tokio::time::timeout(self.setup_timeout, self.backend.submit(code))
            .await
            .map_err(|_| {
                UnitError::Unavailable(format!(
                    "{} did not accept the task within {}s",
                    self.backend.name(),
                    self.setup_timeout.as_secs_f64()
                ))
            })??;
        tracing::debug!(backend = self.backend.name(), task = %task, "task submitted");
        Ok(Box::new(DelegatedUnit {
            backend: self.backend.clone(),
            task,
            poll_interval: self.poll_interval,
            outcome: None,
            revoked: false,
        }))
    }
}

struct DelegatedUnit {
    backend: Arc<dyn ExecutionBackend>,
    task: TaskId,
    poll_interval: Duration,
    outcome: Option<UnitOutcome>,
    revoked: bool,
}

#[async_trait]
impl ExecutionUnit for DelegatedUnit {
    fn streams(&mut self) -> UnitStreams {
        UnitStreams::default()
    }

    async fn wait(&mut self) -> Result<UnitOutcome> {
        loop {
            if let Some(outcome) = &self.outcome {
                return Ok(outcome.clone());
            }
            match self.backend.poll(&self.task).await? {
                TaskState::Ready(result) => self.outcome = Some(result.into()),
                TaskState::Revoked => self.outcome = Some(UnitOutcome::exited(None)),
                TaskState::Pending => {
                    self.backend
                        .wait_ready(&self.task, self.poll_interval)
                        .await
                }
            }
        }
    }

    async fn terminate(&mut self, graceful: bool) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.backend.revoke(&self.task, graceful).await?;
        if !graceful {
            self.revoked = true;
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.outcome.is_none() && !self.revoked
    }

    fn identifier(&self) -> String {
        format!("task:{}", self.task)
    }
}
