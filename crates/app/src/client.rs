use std::time::Duration;

use async_trait::async_trait;
use engine::TaskResult;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::WorkerHandle;
use crate::protocol::{RunRequest, WorkerRequest, WorkerResponse};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Speaks the JSON-lines worker protocol over a child's stdin/stdout.
pub struct WorkerClient {
    child: Child,
    pid: Option<u32>,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl WorkerClient {
    pub fn new(mut child: Child) -> Result<Self, String> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| "sandbox worker missing stdin".to_owned())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "sandbox worker missing stdout".to_owned())?;
        Ok(Self {
            pid: child.id(),
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        })
    }

    pub async fn ping(&mut self) -> Result<(), String> {
        match self.send_request(&WorkerRequest::Ping).await? {
            WorkerResponse::Pong => Ok(()),
            WorkerResponse::Error { message } => Err(message),
            other => Err(format!("unexpected ping response: {other:?}")),
        }
    }

    async fn send_request(&mut self, request: &WorkerRequest) -> Result<WorkerResponse, String> {
        let mut line = serde_json::to_string(request).map_err(|err| err.to_string())?;
        line.push('\n');
        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| format!("sandbox worker write failed: {err}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| format!("sandbox worker flush failed: {err}"))?;

        let mut response_line = String::new();
        let read = self
            .stdout
            .read_line(&mut response_line)
            .await
            .map_err(|err| format!("sandbox worker read failed: {err}"))?;
        if read == 0 {
            return Err("sandbox worker closed stdout".to_owned());
        }
        serde_json::from_str(response_line.trim_end())
            .map_err(|err| format!("sandbox worker invalid response: {err}"))
    }

    async fn shutdown_graceful(&mut self) {
        let shutdown = self.send_request(&WorkerRequest::Shutdown);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
            tracing::debug!(worker = %self.identifier(), "worker did not acknowledge shutdown");
        }
    }
}

#[async_trait]
impl WorkerHandle for WorkerClient {
    async fn run(&mut self, request: RunRequest) -> Result<TaskResult, String> {
        match self.send_request(&WorkerRequest::Run(request)).await? {
            WorkerResponse::RunResult(result) => Ok(result),
            WorkerResponse::Error { message } => Err(message),
            other => Err(format!("unexpected run response: {other:?}")),
        }
    }

    async fn terminate(&mut self) {
        self.shutdown_graceful().await;
        let _ = self.child.kill().await;
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn identifier(&self) -> String {
        match self.pid {
            Some(pid) => format!("pid:{pid}"),
            None => "pid:exited".to_owned(),
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}
