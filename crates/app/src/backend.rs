use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use engine::{ExecutionBackend, TaskId, TaskResult, TaskState, UnitError};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::WorkerHandle;
use crate::pool::WorkerPool;
use crate::protocol::RunRequest;

type TaskTable = Arc<Mutex<HashMap<TaskId, TaskEntry>>>;

struct TaskEntry {
    state: TaskState,
    pid: Option<u32>,
    ready: watch::Receiver<bool>,
    runner: Option<AbortHandle>,
}

/// Runs tasks on pooled sandbox workers. Each task holds one worker for its
/// whole run; waiters are woken as soon as the worker answers.
pub struct WorkerBackend {
    pool: Arc<WorkerPool>,
    run_timeout: Duration,
    tasks: TaskTable,
}

impl WorkerBackend {
    pub fn new(pool: Arc<WorkerPool>, run_timeout: Duration) -> Self {
        Self {
            pool,
            run_timeout,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout_secs(&self) -> u64 {
        let secs = self.run_timeout.as_secs();
        if self.run_timeout.subsec_nanos() > 0 { secs + 1 } else { secs.max(1) }
    }
}

async fn run_task(
    mut worker: Box<dyn WorkerHandle>,
    request: RunRequest,
    pool: Arc<WorkerPool>,
    tasks: TaskTable,
    task: TaskId,
    ready: watch::Sender<bool>,
) {
    let result = worker.run(request).await;
    let healthy = result.is_ok();
    let result = result.unwrap_or_else(|err| {
        tracing::warn!(task = %task, worker = %worker.identifier(), error = %err, "sandbox worker failed");
        TaskResult::failed(err)
    });
    if let Some(entry) = tasks
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(&task)
    {
        entry.state = TaskState::Ready(result);
        entry.runner = None;
    }
    let _ = ready.send(true);

    if healthy {
        pool.release(worker).await;
    } else {
        pool.retire(worker).await;
    }
}

fn interrupt(pid: u32) -> Result<(), UnitError> {
    let pid = i32::try_from(pid)
        .map_err(|_| UnitError::Terminate(format!("pid {pid} out of range")))?;
    match kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(UnitError::Terminate(format!(
            "SIGINT to sandbox worker {pid}: {err}"
        ))),
    }
}

#[async_trait]
impl ExecutionBackend for WorkerBackend {
    fn name(&self) -> &'static str {
        "sandbox workers"
    }

    async fn submit(&self, code: &str) -> Result<TaskId, UnitError> {
        let worker = self.pool.acquire().await.map_err(UnitError::Backend)?;
        let task = TaskId(Uuid::new_v4().to_string());
        let (ready_tx, ready_rx) = watch::channel(false);
        tracing::debug!(task = %task, worker = %worker.identifier(), "dispatching task");
        self.lock().insert(
            task.clone(),
            TaskEntry {
                state: TaskState::Pending,
                pid: worker.pid(),
                ready: ready_rx,
                runner: None,
            },
        );

        let request = RunRequest {
            code: code.to_owned(),
            timeout_secs: self.timeout_secs(),
        };
        let runner = tokio::spawn(run_task(
            worker,
            request,
            self.pool.clone(),
            self.tasks.clone(),
            task.clone(),
            ready_tx,
        ));
        if let Some(entry) = self.lock().get_mut(&task) {
            if matches!(entry.state, TaskState::Pending) {
                entry.runner = Some(runner.abort_handle());
            }
        }
        Ok(task)
    }

    async fn poll(&self, task: &TaskId) -> Result<TaskState, UnitError> {
        let mut tasks = self.lock();
        let Some(entry) = tasks.get(task) else {
            return Err(UnitError::Backend(format!("unknown task {task}")));
        };
        if matches!(entry.state, TaskState::Pending) {
            return Ok(TaskState::Pending);
        }
        Ok(tasks
            .remove(task)
            .map_or(TaskState::Revoked, |entry| entry.state))
    }

    async fn revoke(&self, task: &TaskId, graceful: bool) -> Result<(), UnitError> {
        let (pid, runner) = {
            let mut tasks = self.lock();
            let Some(entry) = tasks.get_mut(task) else {
                return Ok(());
            };
            if !matches!(entry.state, TaskState::Pending) {
                return Ok(());
            }
            if graceful {
                (entry.pid, None)
            } else {
                entry.state = TaskState::Revoked;
                (None, entry.runner.take())
            }
        };

        if graceful {
            match pid {
                Some(pid) => interrupt(pid)?,
                None => tracing::debug!(task = %task, "worker has no process to interrupt"),
            }
            return Ok(());
        }
        // Dropping the runner drops its worker, which kills the process.
        if let Some(runner) = runner {
            runner.abort();
        }
        tracing::info!(task = %task, "task revoked; sandbox worker killed");
        Ok(())
    }

    async fn wait_ready(&self, task: &TaskId, poll_interval: Duration) {
        let ready = self.lock().get(task).map(|entry| entry.ready.clone());
        match ready {
            Some(mut ready) => {
                let _ = tokio::time::timeout(poll_interval, ready.wait_for(|done| *done)).await;
            }
            None => tokio::time::sleep(poll_interval).await,
        }
    }
}
