use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use engine::unit::OutputStream;
use engine::{
    DelegatedStrategy, Engine, EngineConfig, ExecutionBackend, ExecutionStrategy, ExecutionUnit,
    OutputEvent, TaskId, TaskResult, TaskState, TaskStatus, UnitError, UnitOutcome, UnitStreams,
};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::sync::{Notify, mpsc, oneshot};

fn fast_config(timeout_ms: u64) -> EngineConfig {
    EngineConfig {
        execution_timeout: Duration::from_millis(timeout_ms),
        termination_grace: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        setup_timeout: Duration::from_secs(1),
    }
}

async fn collect(mut events: mpsc::Receiver<OutputEvent>) -> Vec<OutputEvent> {
    let mut collected = Vec::new();
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
    })
    .await;
    assert!(drained.is_ok(), "event stream did not close: {collected:?}");
    collected
}

fn of_kind<'a>(events: &'a [OutputEvent], kind: &str) -> Vec<&'a OutputEvent> {
    events.iter().filter(|event| event.kind() == kind).collect()
}

fn assert_single_terminal_last(events: &[OutputEvent]) {
    let terminals = events.iter().filter(|event| event.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event: {events:?}");
    assert!(events.last().is_some_and(OutputEvent::is_terminal));
}

// ---------------------------------------------------------------------------
// Scripted backend for the delegated strategy
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Script {
    Ready(TaskResult),
    NeverReady,
    FailPoll,
}

#[derive(Default)]
struct MockBackend {
    scripts: Mutex<VecDeque<Script>>,
    tasks: Mutex<HashMap<TaskId, Script>>,
    revoked: Mutex<HashSet<TaskId>>,
    revocations: Mutex<Vec<(TaskId, bool)>>,
    ignore_graceful: AtomicBool,
    reject_submit: AtomicBool,
}

impl MockBackend {
    fn with(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        })
    }

    fn revocations(&self) -> Vec<(TaskId, bool)> {
        self.revocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(&self, _code: &str) -> Result<TaskId, UnitError> {
        if self.reject_submit.load(Ordering::SeqCst) {
            return Err(UnitError::Backend("broker unreachable".to_owned()));
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::NeverReady);
        let mut tasks = self.tasks.lock().unwrap();
        let task = TaskId(format!("task-{}", tasks.len() + 1));
        tasks.insert(task.clone(), script);
        Ok(task)
    }

    async fn poll(&self, task: &TaskId) -> Result<TaskState, UnitError> {
        if self.revoked.lock().unwrap().contains(task) {
            return Ok(TaskState::Revoked);
        }
        match self.tasks.lock().unwrap().get(task).cloned() {
            Some(Script::Ready(result)) => Ok(TaskState::Ready(result)),
            Some(Script::NeverReady) => Ok(TaskState::Pending),
            Some(Script::FailPoll) => Err(UnitError::Backend("result store unreachable".to_owned())),
            None => Err(UnitError::Backend(format!("unknown task {task}"))),
        }
    }

    async fn revoke(&self, task: &TaskId, graceful: bool) -> Result<(), UnitError> {
        self.revocations.lock().unwrap().push((task.clone(), graceful));
        if !graceful || !self.ignore_graceful.load(Ordering::SeqCst) {
            self.revoked.lock().unwrap().insert(task.clone());
        }
        Ok(())
    }
}

fn success(stdout: &str) -> Script {
    Script::Ready(TaskResult {
        status: TaskStatus::Success,
        stdout: Some(stdout.to_owned()),
        stderr: Some(String::new()),
        exit_code: Some(0),
        error: None,
    })
}

fn delegated_engine(backend: Arc<MockBackend>, timeout_ms: u64) -> Engine {
    let config = fast_config(timeout_ms);
    let strategy = DelegatedStrategy::new(backend)
        .with_poll_interval(config.poll_interval)
        .with_setup_timeout(config.setup_timeout);
    Engine::new(Arc::new(strategy), config)
}

#[tokio::test]
async fn hello_world_streams_stdout_and_completes() {
    let engine = delegated_engine(MockBackend::with(vec![success("Hello, World!\n")]), 5_000);

    let submission = engine.submit(r#"print("Hello, World!")"#);
    let events = collect(submission.events).await;

    assert_eq!(of_kind(&events, "execution_start").len(), 1);
    let stdout = of_kind(&events, "stdout");
    assert_eq!(stdout.len(), 1);
    assert!(matches!(
        stdout[0],
        OutputEvent::Stdout { content, .. } if content == "Hello, World!"
    ));
    match events.last() {
        Some(OutputEvent::ExecutionComplete {
            success, exit_code, ..
        }) => {
            assert!(*success);
            assert_eq!(*exit_code, Some(0));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_single_terminal_last(&events);
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn backend_error_status_is_an_error_event() {
    let engine = delegated_engine(
        MockBackend::with(vec![Script::Ready(TaskResult {
            status: TaskStatus::Error,
            stdout: None,
            stderr: None,
            exit_code: Some(1),
            error: Some("invalid syntax (<string>, line 1)".to_owned()),
        })]),
        5_000,
    );

    let events = collect(engine.submit(r#"print("Hello" + )"#).events).await;

    assert_eq!(events[0].kind(), "execution_start");
    assert!(of_kind(&events, "execution_complete").is_empty());
    match events.last() {
        Some(OutputEvent::Error { message, execution_id }) => {
            assert!(message.contains("invalid syntax"));
            assert!(execution_id.is_some());
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_single_terminal_last(&events);
}

#[tokio::test]
async fn never_ready_task_times_out_and_is_revoked() {
    let backend = MockBackend::with(vec![Script::NeverReady]);
    let engine = delegated_engine(backend.clone(), 300);

    let started = std::time::Instant::now();
    let submission = engine.submit("while True: pass");
    let id = submission.execution_id.clone();
    let events = collect(submission.events).await;
    let elapsed = started.elapsed();

    let timeouts = of_kind(&events, "timeout");
    assert_eq!(timeouts.len(), 1);
    assert!(matches!(
        timeouts[0],
        OutputEvent::Timeout { message, .. } if message.to_lowercase().contains("timed out")
    ));
    assert_single_terminal_last(&events);
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(!engine.is_active(&id));
    assert_eq!(backend.revocations().len(), 1);
}

#[tokio::test]
async fn graceful_revoke_ignored_escalates_to_forced() {
    let backend = MockBackend::with(vec![Script::NeverReady]);
    backend.ignore_graceful.store(true, Ordering::SeqCst);
    let engine = delegated_engine(backend.clone(), 200);

    let events = collect(engine.submit("while True: pass").events).await;

    assert_eq!(of_kind(&events, "timeout").len(), 1);
    let revocations = backend.revocations();
    let modes: Vec<bool> = revocations.iter().map(|(_, graceful)| *graceful).collect();
    assert_eq!(modes, vec![true, false]);
}

#[tokio::test]
async fn stop_running_execution_emits_timeout_kind_event() {
    let backend = MockBackend::with(vec![Script::NeverReady]);
    let engine = delegated_engine(backend.clone(), 30_000);

    let submission = engine.submit("for i in range(100): print(i)");
    let id = submission.execution_id.clone();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.list_active().contains(&id));

    let started = std::time::Instant::now();
    assert!(engine.stop(&id).await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!engine.stop(&id).await);

    let events = collect(submission.events).await;
    assert_eq!(events[0].kind(), "execution_start");
    assert!(matches!(
        events.last(),
        Some(OutputEvent::Timeout { execution_id, .. }) if *execution_id == id
    ));
    assert_single_terminal_last(&events);
    assert!(engine.list_active().is_empty());
    assert_eq!(backend.revocations().len(), 1);
}

#[tokio::test]
async fn stop_unknown_id_is_a_no_op() {
    let engine = delegated_engine(MockBackend::with(vec![]), 1_000);
    assert!(!engine.stop(&"nonexistent_id".into()).await);
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn concurrent_executions_do_not_share_events() {
    let engine = delegated_engine(
        MockBackend::with(vec![success("Execution 1\n"), success("Execution 2\n")]),
        5_000,
    );

    let first = engine.submit(r#"print("Execution 1")"#);
    let second = engine.submit(r#"print("Execution 2")"#);
    assert_ne!(first.execution_id, second.execution_id);

    let (first_id, second_id) = (first.execution_id.clone(), second.execution_id.clone());
    let (first_events, second_events) = tokio::join!(collect(first.events), collect(second.events));

    for (id, events) in [(&first_id, &first_events), (&second_id, &second_events)] {
        assert!(events.iter().all(|event| event.execution_id() == Some(id)));
        assert_eq!(of_kind(events, "execution_complete").len(), 1);
    }
    let mut outputs: Vec<String> = [&first_events, &second_events]
        .iter()
        .flat_map(|events| events.iter())
        .filter_map(|event| match event {
            OutputEvent::Stdout { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    outputs.sort();
    assert_eq!(outputs, vec!["Execution 1", "Execution 2"]);
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn submit_failure_is_reported_and_deregistered() {
    let backend = MockBackend::with(vec![]);
    backend.reject_submit.store(true, Ordering::SeqCst);
    let engine = delegated_engine(backend, 1_000);

    let events = collect(engine.submit("print(1)").events).await;

    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[1],
        OutputEvent::Error { message, .. } if message.contains("broker unreachable")
    ));
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn poll_failure_mid_run_is_an_error_event() {
    let engine = delegated_engine(MockBackend::with(vec![Script::FailPoll]), 5_000);

    let events = collect(engine.submit("print(1)").events).await;

    assert!(matches!(
        events.last(),
        Some(OutputEvent::Error { message, .. }) if message.contains("result store unreachable")
    ));
    assert_single_terminal_last(&events);
    assert!(engine.list_active().is_empty());
}

#[tokio::test]
async fn execute_runs_on_the_callers_task() {
    let engine = delegated_engine(MockBackend::with(vec![success("inline\n")]), 5_000);
    let (sink, events) = engine::EventSink::channel();

    let id = engine.execute("print('inline')", sink).await;

    let events = collect(events).await;
    assert!(events.iter().all(|event| event.execution_id() == Some(&id)));
    assert_eq!(of_kind(&events, "execution_complete").len(), 1);
}

// ---------------------------------------------------------------------------
// Scripted streaming units
// ---------------------------------------------------------------------------

/// Writes `lines` numbered lines to stdout and stderr, then exits with
/// `exit_code`. Stops writing when interrupted unless it ignores interrupts.
struct ChattyStrategy {
    lines: usize,
    exit_code: i32,
    broken_stdout: bool,
}

struct ChattyUnit {
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    done: oneshot::Receiver<i32>,
    outcome: Option<UnitOutcome>,
    interrupted: Arc<AtomicBool>,
}

struct Broken;

impl AsyncRead for Broken {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("stream reset")))
    }
}

#[async_trait]
impl ExecutionStrategy for ChattyStrategy {
    fn name(&self) -> &'static str {
        "chatty"
    }

    async fn start(&self, _code: &str) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        let (mut out_writer, out_reader) = tokio::io::duplex(1024);
        let (mut err_writer, err_reader) = tokio::io::duplex(1024);
        let (done_tx, done_rx) = oneshot::channel();
        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        let (lines, exit_code) = (self.lines, self.exit_code);
        tokio::spawn(async move {
            for i in 0..lines {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                let _ = out_writer.write_all(format!("out {i}\n").as_bytes()).await;
                let _ = err_writer.write_all(format!("err {i}\n\n").as_bytes()).await;
                tokio::task::yield_now().await;
            }
            drop((out_writer, err_writer));
            let _ = done_tx.send(exit_code);
        });
        let stdout: OutputStream = if self.broken_stdout {
            Box::new(Broken)
        } else {
            Box::new(out_reader)
        };
        Ok(Box::new(ChattyUnit {
            stdout: Some(stdout),
            stderr: Some(Box::new(err_reader)),
            done: done_rx,
            outcome: None,
            interrupted,
        }))
    }
}

#[async_trait]
impl ExecutionUnit for ChattyUnit {
    fn streams(&mut self) -> UnitStreams {
        UnitStreams {
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
        }
    }

    async fn wait(&mut self) -> Result<UnitOutcome, UnitError> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        let outcome = match (&mut self.done).await {
            Ok(code) => UnitOutcome::exited(Some(code)),
            Err(_) => UnitOutcome::exited(None),
        };
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    async fn terminate(&mut self, _graceful: bool) -> Result<(), UnitError> {
        self.interrupted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        self.outcome.is_none() && !self.interrupted.load(Ordering::SeqCst)
    }

    fn identifier(&self) -> String {
        "chatty".to_owned()
    }
}

#[tokio::test]
async fn per_stream_order_is_preserved() {
    let engine = Engine::new(
        Arc::new(ChattyStrategy {
            lines: 200,
            exit_code: 3,
            broken_stdout: false,
        }),
        fast_config(5_000),
    );

    let events = collect(engine.submit("chatty").events).await;

    let stdout: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::Stdout { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    let stderr: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            OutputEvent::Stderr { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    let expected_out: Vec<String> = (0..200).map(|i| format!("out {i}")).collect();
    let expected_err: Vec<String> = (0..200).map(|i| format!("err {i}")).collect();
    assert_eq!(stdout, expected_out);
    assert_eq!(stderr, expected_err);

    match events.last() {
        Some(OutputEvent::ExecutionComplete {
            success,
            exit_code,
            message,
            ..
        }) => {
            assert!(!*success);
            assert_eq!(*exit_code, Some(3));
            assert!(message.contains("exit code: 3"));
        }
        other => panic!("expected completion, got {other:?}"),
    }
    assert_single_terminal_last(&events);
}

#[tokio::test]
async fn relay_failure_ends_execution_with_single_error() {
    let engine = Engine::new(
        Arc::new(ChattyStrategy {
            lines: 1_000_000,
            exit_code: 0,
            broken_stdout: true,
        }),
        fast_config(5_000),
    );

    let events = collect(engine.submit("chatty").events).await;

    assert!(matches!(
        events.last(),
        Some(OutputEvent::Error { message, .. }) if message.contains("stream reset")
    ));
    assert_single_terminal_last(&events);
    assert!(engine.list_active().is_empty());
}

// ---------------------------------------------------------------------------
// Units that are slow to start or slow to drain
// ---------------------------------------------------------------------------

/// `start` announces itself on `entered` and then never returns.
struct StuckStart {
    entered: Arc<Notify>,
}

#[async_trait]
impl ExecutionStrategy for StuckStart {
    fn name(&self) -> &'static str {
        "stuck"
    }

    async fn start(&self, _code: &str) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        self.entered.notify_one();
        std::future::pending().await
    }
}

#[tokio::test]
async fn stop_while_unit_is_starting_ends_with_timeout() {
    let entered = Arc::new(Notify::new());
    let engine = Engine::new(
        Arc::new(StuckStart {
            entered: entered.clone(),
        }),
        fast_config(30_000),
    );

    let submission = engine.submit("print(1)");
    let id = submission.execution_id.clone();
    entered.notified().await;
    assert!(engine.is_active(&id));

    assert!(engine.stop(&id).await);
    let events = collect(submission.events).await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind(), "execution_start");
    assert!(matches!(
        &events[1],
        OutputEvent::Timeout { execution_id, message } if *execution_id == id && message.contains("stopped")
    ));
    assert!(engine.list_active().is_empty());
}

/// Exits at once but keeps stdout open for `linger`.
struct LingeringOutput {
    linger: Duration,
}

struct ExitedUnit {
    stdout: Option<OutputStream>,
}

#[async_trait]
impl ExecutionStrategy for LingeringOutput {
    fn name(&self) -> &'static str {
        "lingering"
    }

    async fn start(&self, _code: &str) -> Result<Box<dyn ExecutionUnit>, UnitError> {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let linger = self.linger;
        tokio::spawn(async move {
            let _ = writer.write_all(b"last words\n").await;
            tokio::time::sleep(linger).await;
        });
        Ok(Box::new(ExitedUnit {
            stdout: Some(Box::new(reader)),
        }))
    }
}

#[async_trait]
impl ExecutionUnit for ExitedUnit {
    fn streams(&mut self) -> UnitStreams {
        UnitStreams {
            stdout: self.stdout.take(),
            stderr: None,
        }
    }

    async fn wait(&mut self) -> Result<UnitOutcome, UnitError> {
        Ok(UnitOutcome::exited(Some(0)))
    }

    async fn terminate(&mut self, _graceful: bool) -> Result<(), UnitError> {
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        false
    }

    fn identifier(&self) -> String {
        "exited".to_owned()
    }
}

#[tokio::test]
async fn stop_after_exit_reports_false_and_completes() {
    let engine = Engine::new(
        Arc::new(LingeringOutput {
            linger: Duration::from_millis(300),
        }),
        fast_config(5_000),
    );

    let submission = engine.submit("print('last words')");
    let id = submission.execution_id.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!engine.stop(&id).await);
    let events = collect(submission.events).await;

    assert!(matches!(
        &events[1],
        OutputEvent::Stdout { content, .. } if content == "last words"
    ));
    assert!(matches!(events.last(), Some(OutputEvent::ExecutionComplete { success: true, .. })));
    assert_single_terminal_last(&events);
}
