use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::UnitError;
use crate::event::{EventSink, ExecutionId, IdGenerator, OutputEvent, StreamKind};
use crate::registry::{ActiveExecution, ExecutionRegistry};
use crate::relay::spawn_relay;
use crate::unit::{ExecutionStrategy, ExecutionUnit, UnitOutcome};

pub const START_MESSAGE: &str = "Starting Python execution...";

/// Extra time `stop` waits beyond the two grace windows of the escalation.
const STOP_MARGIN: Duration = Duration::from_millis(500);

/// Runs submissions on units produced by one [`ExecutionStrategy`] and keeps
/// the registry of live executions. Cloning shares the registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    strategy: Arc<dyn ExecutionStrategy>,
    config: EngineConfig,
    registry: ExecutionRegistry,
    ids: IdGenerator,
}

/// A submission handed to the runtime by [`Engine::submit`].
pub struct Submission {
    pub execution_id: ExecutionId,
    pub events: mpsc::Receiver<OutputEvent>,
    pub handle: JoinHandle<()>,
}

struct Admission {
    execution_id: ExecutionId,
    cancel: CancellationToken,
    finished: watch::Sender<Option<bool>>,
}

enum Ending {
    Finished(UnitOutcome),
    TimedOut,
    Cancelled,
    Fault(String),
}

/// Removes the registry entry and signals `stop` callers, even if the
/// workflow unwinds. `stop` learns whether its cancellation produced the
/// terminal event.
struct Deregistration<'a> {
    registry: &'a ExecutionRegistry,
    execution_id: &'a ExecutionId,
    finished: watch::Sender<Option<bool>>,
    stopped: bool,
}

impl Deregistration<'_> {
    fn deregister(&self) {
        self.registry.remove(self.execution_id);
    }
}

impl Drop for Deregistration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.execution_id);
        let _ = self.finished.send(Some(self.stopped));
    }
}

impl Engine {
    pub fn new(strategy: Arc<dyn ExecutionStrategy>, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                strategy,
                config,
                registry: ExecutionRegistry::new(),
                ids: IdGenerator::new(),
            }),
        }
    }

    /// Admits `code` and runs it on a spawned task. The identifier is
    /// registered before this returns, so it can be stopped right away.
    pub fn submit(&self, code: impl Into<String>) -> Submission {
        let (sink, events) = EventSink::channel();
        let (execution_id, handle) = self.submit_with_sink(code, sink);
        Submission {
            execution_id,
            events,
            handle,
        }
    }

    pub fn submit_with_sink(
        &self,
        code: impl Into<String>,
        sink: EventSink,
    ) -> (ExecutionId, JoinHandle<()>) {
        let admission = self.admit();
        let execution_id = admission.execution_id.clone();
        let engine = self.clone();
        let code = code.into();
        let handle = tokio::spawn(async move {
            engine.run(admission, &code, sink).await;
        });
        (execution_id, handle)
    }

    /// Runs `code` to completion on the caller's task.
    pub async fn execute(&self, code: &str, sink: EventSink) -> ExecutionId {
        let admission = self.admit();
        let execution_id = admission.execution_id.clone();
        self.run(admission, code, sink).await;
        execution_id
    }

    /// Stops a live execution. Returns `false` for unknown or finished ids,
    /// and also when the unit had already exited by the time the request
    /// landed: that execution still ends with `execution_complete`.
    pub async fn stop(&self, execution_id: &ExecutionId) -> bool {
        let Some(entry) = self.inner.registry.remove(execution_id) else {
            return false;
        };
        tracing::info!(execution_id = %execution_id, "stop requested");
        entry.cancel.cancel();

        let mut finished = entry.finished;
        let bound = self.inner.config.termination_grace * 2 + STOP_MARGIN;
        match tokio::time::timeout(bound, finished.wait_for(Option::is_some)).await {
            Ok(Ok(stopped)) => (*stopped).unwrap_or(true),
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(execution_id = %execution_id, "execution still winding down after stop");
                true
            }
        }
    }

    pub fn list_active(&self) -> Vec<ExecutionId> {
        self.inner.registry.ids()
    }

    pub fn active_executions(&self) -> Vec<ActiveExecution> {
        self.inner.registry.snapshot()
    }

    pub fn is_active(&self, execution_id: &ExecutionId) -> bool {
        self.inner.registry.contains(execution_id)
    }

    fn admit(&self) -> Admission {
        loop {
            let execution_id = self.inner.ids.next_id();
            let cancel = CancellationToken::new();
            let (finished, finished_rx) = watch::channel(None);
            if self
                .inner
                .registry
                .register(execution_id.clone(), cancel.clone(), finished_rx)
            {
                return Admission {
                    execution_id,
                    cancel,
                    finished,
                };
            }
            tracing::warn!(execution_id = %execution_id, "identifier collision; regenerating");
        }
    }

    async fn run(&self, admission: Admission, code: &str, sink: EventSink) {
        let Admission {
            execution_id,
            cancel,
            finished,
        } = admission;
        let mut cleanup = Deregistration {
            registry: &self.inner.registry,
            execution_id: &execution_id,
            finished,
            stopped: false,
        };

        sink.send(OutputEvent::ExecutionStart {
            execution_id: execution_id.clone(),
            message: START_MESSAGE.to_owned(),
        })
        .await;
        tracing::info!(
            execution_id = %execution_id,
            strategy = self.inner.strategy.name(),
            code_len = code.len(),
            "execution admitted"
        );

        let terminal = self.drive(&execution_id, code, &sink, &cancel).await;
        cleanup.stopped = cancel.is_cancelled() && matches!(terminal, OutputEvent::Timeout { .. });
        cleanup.deregister();
        tracing::info!(execution_id = %execution_id, outcome = terminal.kind(), "execution finished");
        sink.send(terminal).await;
        drop(cleanup);
    }

    async fn drive(
        &self,
        execution_id: &ExecutionId,
        code: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> OutputEvent {
        let admitted_at = Instant::now();
        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.stopped_event(execution_id, admitted_at.elapsed());
            }
            started = self.inner.strategy.start(code) => started,
        };
        let mut unit = match started {
            Ok(unit) => unit,
            Err(UnitError::Rejected(detail)) => {
                tracing::info!(execution_id = %execution_id, detail = %detail, "submission rejected");
                return execution_error(execution_id, &detail);
            }
            Err(err) => {
                tracing::error!(execution_id = %execution_id, error = %err, "failed to start execution unit");
                return execution_error(execution_id, &err.to_string());
            }
        };
        self.inner
            .registry
            .mark_running(execution_id, unit.identifier());
        tracing::debug!(execution_id = %execution_id, unit = %unit.identifier(), "unit running");

        let streams = unit.streams();
        let (fault_tx, mut faults) = mpsc::unbounded_channel();
        let relays = vec![
            spawn_relay(
                streams.stdout,
                sink.clone(),
                execution_id.clone(),
                StreamKind::Stdout,
                fault_tx.clone(),
            ),
            spawn_relay(
                streams.stderr,
                sink.clone(),
                execution_id.clone(),
                StreamKind::Stderr,
                fault_tx,
            ),
        ];

        let started_at = Instant::now();
        let deadline_at = started_at + self.inner.config.execution_timeout;
        let deadline = tokio::time::sleep_until(deadline_at);
        let ending = tokio::select! {
            result = unit.wait() => match result {
                Ok(outcome) => Ending::Finished(outcome),
                Err(err) => Ending::Fault(err.to_string()),
            },
            _ = deadline => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
            Some(fault) = faults.recv() => Ending::Fault(fault),
        };

        let grace = self.inner.config.termination_grace;
        match ending {
            Ending::Finished(outcome) => {
                // A consumer that is still catching up keeps its output, up
                // to the execution deadline.
                let within = grace.max(deadline_at.saturating_duration_since(Instant::now()));
                drain(relays, within).await;
                if let Ok(fault) = faults.try_recv() {
                    tracing::error!(execution_id = %execution_id, error = %fault, "output relay failed");
                    return execution_error(execution_id, &fault);
                }
                emit_buffered(sink, execution_id, StreamKind::Stdout, outcome.stdout.as_deref()).await;
                emit_buffered(sink, execution_id, StreamKind::Stderr, outcome.stderr.as_deref()).await;
                if let Some(failure) = &outcome.failure {
                    tracing::info!(execution_id = %execution_id, detail = %failure, "execution reported failure");
                    return execution_error(execution_id, failure);
                }
                tracing::debug!(execution_id = %execution_id, exit_code = ?outcome.exit_code, "unit exited");
                OutputEvent::ExecutionComplete {
                    execution_id: execution_id.clone(),
                    message: outcome.summary(),
                    exit_code: outcome.exit_code,
                    success: outcome.success(),
                }
            }
            Ending::TimedOut => {
                let timeout = self.inner.config.execution_timeout;
                tracing::info!(
                    execution_id = %execution_id,
                    timeout_secs = timeout.as_secs_f64(),
                    "execution timed out"
                );
                terminate_unit(unit.as_mut(), execution_id, grace).await;
                drain(relays, grace).await;
                OutputEvent::Timeout {
                    execution_id: execution_id.clone(),
                    message: format!(
                        "Execution timed out after {} seconds. Did you check for infinite loops?",
                        format_seconds(timeout)
                    ),
                }
            }
            Ending::Cancelled => {
                terminate_unit(unit.as_mut(), execution_id, grace).await;
                drain(relays, grace).await;
                self.stopped_event(execution_id, started_at.elapsed())
            }
            Ending::Fault(fault) => {
                tracing::error!(execution_id = %execution_id, error = %fault, "execution fault");
                terminate_unit(unit.as_mut(), execution_id, grace).await;
                abort(relays).await;
                execution_error(execution_id, &fault)
            }
        }
    }

    fn stopped_event(&self, execution_id: &ExecutionId, elapsed: Duration) -> OutputEvent {
        OutputEvent::Timeout {
            execution_id: execution_id.clone(),
            message: format!(
                "Execution stopped by request after {:.1} seconds.",
                elapsed.as_secs_f64()
            ),
        }
    }
}

/// Graceful stop, then a forced one if the unit outlives the grace window.
async fn terminate_unit(unit: &mut dyn ExecutionUnit, execution_id: &ExecutionId, grace: Duration) {
    if !unit.is_alive() {
        return;
    }
    if let Err(err) = unit.terminate(true).await {
        tracing::warn!(execution_id = %execution_id, error = %err, "graceful termination failed");
    }
    if matches!(tokio::time::timeout(grace, unit.wait()).await, Ok(Ok(_))) && !unit.is_alive() {
        return;
    }

    tracing::warn!(execution_id = %execution_id, unit = %unit.identifier(), "unit outlived grace window; killing");
    if let Err(err) = unit.terminate(false).await {
        tracing::error!(execution_id = %execution_id, error = %err, "forced termination failed");
    }
    if tokio::time::timeout(grace, unit.wait()).await.is_err() && unit.is_alive() {
        tracing::error!(execution_id = %execution_id, unit = %unit.identifier(), "unit still alive after kill");
    }
}

/// Lets relays forward what is already buffered, up to `within`; whatever is
/// still reading after that is aborted.
async fn drain(relays: Vec<JoinHandle<()>>, within: Duration) {
    let deadline = Instant::now() + within;
    for mut relay in relays {
        if tokio::time::timeout_at(deadline, &mut relay).await.is_err() {
            relay.abort();
            let _ = relay.await;
        }
    }
}

async fn abort(relays: Vec<JoinHandle<()>>) {
    for relay in relays {
        relay.abort();
        let _ = relay.await;
    }
}

async fn emit_buffered(
    sink: &EventSink,
    execution_id: &ExecutionId,
    kind: StreamKind,
    buffered: Option<&str>,
) {
    let Some(buffered) = buffered else {
        return;
    };
    for line in buffered.lines() {
        let line = line.trim_end();
        if !line.is_empty() {
            sink.send(OutputEvent::line(execution_id.clone(), kind, line.to_owned()))
                .await;
        }
    }
}

fn execution_error(execution_id: &ExecutionId, detail: &str) -> OutputEvent {
    OutputEvent::Error {
        execution_id: Some(execution_id.clone()),
        message: format!(
            "Execution error occurred: {detail}. Please check your code syntax and try again."
        ),
    }
}

fn format_seconds(duration: Duration) -> String {
    if duration.subsec_millis() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{:.1}", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_seconds_format_without_fraction() {
        assert_eq!(format_seconds(Duration::from_secs(30)), "30");
        assert_eq!(format_seconds(Duration::from_millis(1500)), "1.5");
    }

    #[tokio::test]
    async fn buffered_output_skips_blank_lines() {
        let (sink, mut events) = EventSink::channel();
        let id = ExecutionId::from("exec-buffered");
        emit_buffered(&sink, &id, StreamKind::Stdout, Some("one\n\n  \ntwo\n")).await;
        emit_buffered(&sink, &id, StreamKind::Stderr, None).await;
        let mut contents = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OutputEvent::Stdout { content, .. } = event {
                contents.push(content);
            }
        }
        assert_eq!(contents, vec!["one", "two"]);
    }
}
