use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use app::protocol::{RunRequest, WorkerRequest, WorkerResponse};
use app::worker_strategy;
use engine::config::{DEFAULT_PYTHON_BIN, DEFAULT_TERMINATION_GRACE_MS, env_or};
use engine::unit::OutputStream;
use engine::{ExecutionStrategy, ExecutionUnit, TaskResult, TaskStatus, UnitError, UnitOutcome};
use futures::FutureExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

enum Ending {
    Finished(Result<UnitOutcome, UnitError>),
    TimedOut,
    Interrupted,
}

/// Output a unit wrote so far; survives the reader being cut off.
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: JoinHandle<()>,
}

impl Capture {
    fn start(stream: Option<OutputStream>) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = buffer.clone();
        let reader = tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => {
                        sink.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .extend_from_slice(&chunk[..read]);
                    }
                }
            }
        });
        Self { buffer, reader }
    }

    async fn finish(self, within: Duration) -> Option<String> {
        let mut reader = self.reader;
        if tokio::time::timeout(within, &mut reader).await.is_err() {
            reader.abort();
        }
        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        (!bytes.is_empty()).then(|| String::from_utf8_lossy(&bytes).into_owned())
    }
}

async fn stop(unit: &mut dyn ExecutionUnit, grace: Duration) {
    for graceful in [true, false] {
        if !unit.is_alive() {
            return;
        }
        if let Err(err) = unit.terminate(graceful).await {
            tracing::warn!(graceful, error = %err, "failed to stop unit");
        }
        let _ = tokio::time::timeout(grace, unit.wait()).await;
    }
}

async fn run(
    strategy: &dyn ExecutionStrategy,
    request: RunRequest,
    interrupts: &mut Signal,
    grace: Duration,
) -> TaskResult {
    let mut unit = match strategy.start(&request.code).await {
        Ok(unit) => unit,
        Err(UnitError::Rejected(detail)) => return TaskResult::failed(detail),
        Err(err) => return TaskResult::failed(err.to_string()),
    };
    let streams = unit.streams();
    let stdout = Capture::start(streams.stdout);
    let stderr = Capture::start(streams.stderr);

    let limit = Duration::from_secs(request.timeout_secs);
    let ending = tokio::select! {
        outcome = unit.wait() => Ending::Finished(outcome),
        _ = tokio::time::sleep(limit) => Ending::TimedOut,
        _ = interrupts.recv() => Ending::Interrupted,
    };
    let failure = match ending {
        Ending::Finished(Ok(outcome)) => {
            let (stdout, stderr) = (stdout.finish(grace).await, stderr.finish(grace).await);
            return match outcome.failure {
                Some(error) => TaskResult {
                    status: TaskStatus::Error,
                    stdout,
                    stderr,
                    exit_code: outcome.exit_code,
                    error: Some(error),
                },
                None => TaskResult {
                    status: TaskStatus::Success,
                    stdout,
                    stderr,
                    exit_code: outcome.exit_code,
                    error: None,
                },
            };
        }
        Ending::Finished(Err(err)) => err.to_string(),
        Ending::TimedOut => format!("execution timed out after {} seconds", request.timeout_secs),
        Ending::Interrupted => "execution interrupted".to_owned(),
    };

    tracing::info!(unit = %unit.identifier(), reason = %failure, "stopping unit");
    stop(unit.as_mut(), grace).await;
    TaskResult {
        stdout: stdout.finish(grace).await,
        stderr: stderr.finish(grace).await,
        ..TaskResult::failed(failure)
    }
}

async fn emit(
    stdout: &mut (impl AsyncWrite + Unpin),
    response: &WorkerResponse,
) -> anyhow::Result<()> {
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    stdout.write_all(payload.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn serve(strategy: Arc<dyn ExecutionStrategy>, grace: Duration) -> anyhow::Result<()> {
    // Handling SIGINT here keeps it from killing the worker; it only ever
    // interrupts the run in progress.
    let mut interrupts = signal(SignalKind::interrupt())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let message = format!("stdin read failed: {err}");
                emit(&mut stdout, &WorkerResponse::Error { message }).await?;
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                let message = format!("invalid request: {err}");
                emit(&mut stdout, &WorkerResponse::Error { message }).await?;
                continue;
            }
        };
        match request {
            WorkerRequest::Ping => emit(&mut stdout, &WorkerResponse::Pong).await?,
            WorkerRequest::Shutdown => {
                emit(&mut stdout, &WorkerResponse::Ack).await?;
                break;
            }
            WorkerRequest::Run(request) => {
                // Interrupts aimed at an earlier run must not cancel this one.
                while let Some(Some(())) = interrupts.recv().now_or_never() {}
                let result = run(strategy.as_ref(), request, &mut interrupts, grace).await;
                emit(&mut stdout, &WorkerResponse::RunResult(result)).await?;
            }
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let python_bin: String = env_or("PYTHON_BIN", DEFAULT_PYTHON_BIN.to_owned())?;
    let grace = Duration::from_millis(env_or(
        "TERMINATION_GRACE_MS",
        DEFAULT_TERMINATION_GRACE_MS,
    )?);
    let strategy = worker_strategy(&python_bin);
    tracing::debug!(strategy = strategy.name(), "sandbox worker starting");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(strategy, grace))
}
