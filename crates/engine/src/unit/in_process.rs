use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use async_trait::async_trait;
use rustpython_vm as vm;
use rustpython_vm::builtins::PyBaseException;
use rustpython_vm::scope::Scope;
use rustpython_vm::{Interpreter, InterpreterBuilder};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use super::{ExecutionStrategy, ExecutionUnit, OutputStream, UnitOutcome, UnitStreams};
use crate::error::{Result, UnitError};

const PIPE_CAPACITY: usize = 64 * 1024;
const VM_STACK_SIZE: usize = 16 * 1024 * 1024;

const HARNESS: &str = r#"import sys

class __SandboxStream:
    def __init__(self, emit):
        self._emit = emit

    def write(self, text):
        text = str(text)
        if self._emit(text) != "ok":
            raise BrokenPipeError("output stream closed")
        return len(text)

    def flush(self):
        pass

    def isatty(self):
        return False

def __sandbox_trace(frame, event, arg):
    if __sandbox_poll("") != "run":
        raise KeyboardInterrupt("execution interrupted")
    return __sandbox_trace

sys.stdout = __SandboxStream(__sandbox_emit_stdout)
sys.stderr = __SandboxStream(__sandbox_emit_stderr)
__sandbox_exit_code = "0"
__sandbox_failure = ""
try:
    __sandbox_compiled = compile(__sandbox_code, "<submission>", "exec")
except (SyntaxError, ValueError) as __sandbox_exc:
    __sandbox_failure = type(__sandbox_exc).__name__ + ": " + str(__sandbox_exc)
    __sandbox_compiled = None

if __sandbox_compiled is not None:
    sys.settrace(__sandbox_trace)
    try:
        exec(__sandbox_compiled, {"__name__": "__main__"})
    except SystemExit as __sandbox_exc:
        sys.settrace(None)
        __sandbox_status = __sandbox_exc.code
        if __sandbox_status is None:
            __sandbox_exit_code = "0"
        elif isinstance(__sandbox_status, int):
            __sandbox_exit_code = str(__sandbox_status)
        else:
            print(__sandbox_status, file=sys.stderr)
            __sandbox_exit_code = "1"
    except BaseException:
        sys.settrace(None)
        import traceback
        traceback.print_exc()
        __sandbox_exit_code = "1"
    finally:
        sys.settrace(None)
"#;

/// Runs each submission inside an embedded Python VM on a dedicated thread.
///
/// Isolation is the weakest of the strategies: the payload shares the
/// service's process. A forced stop severs the unit's output and detaches
/// the thread; it cannot reclaim a thread blocked outside the VM.
#[derive(Debug, Clone, Default)]
pub struct InProcessStrategy;

impl InProcessStrategy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExecutionStrategy for InProcessStrategy {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn start(&self, code: &str) -> Result<Box<dyn ExecutionUnit>> {
        let runtime_handle = Handle::try_current()
            .map_err(|err| UnitError::Unavailable(format!("tokio runtime unavailable: {err}")))?;
        let (stdout_writer, stdout_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_writer, stderr_reader) = tokio::io::duplex(PIPE_CAPACITY);
        let control = Arc::new(UnitControl::default());
        let (done_tx, done_rx) = oneshot::channel();

        let thread_control = control.clone();
        let code = code.to_owned();
        let thread = thread::Builder::new()
            .name("python-unit".to_owned())
            .stack_size(VM_STACK_SIZE)
            .spawn(move || {
                let outcome = run_submission(
                    &code,
                    runtime_handle,
                    OutputPipe::new(stdout_writer),
                    OutputPipe::new(stderr_writer),
                    thread_control,
                );
                let _ = done_tx.send(outcome);
            })
            .map_err(UnitError::Spawn)?;
        let identifier = format!("thread:{:?}", thread.thread().id());

        Ok(Box::new(InProcessUnit {
            control,
            done: done_rx,
            outcome: None,
            stdout: Some(stdout_reader),
            stderr: Some(stderr_reader),
            identifier,
        }))
    }
}

#[derive(Debug, Default)]
struct UnitControl {
    interrupted: AtomicBool,
    severed: AtomicBool,
}

impl UnitControl {
    fn should_run(&self) -> bool {
        !self.interrupted.load(Ordering::SeqCst) && !self.severed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct OutputPipe {
    writer: Arc<Mutex<Option<DuplexStream>>>,
}

impl OutputPipe {
    fn new(writer: DuplexStream) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Some(writer))),
        }
    }

    fn write(&self, runtime_handle: &Handle, control: &UnitControl, text: &str) -> bool {
        if control.severed.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        runtime_handle
            .block_on(writer.write_all(text.as_bytes()))
            .is_ok()
    }

    fn close(&self) {
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn run_submission(
    code: &str,
    runtime_handle: Handle,
    stdout: OutputPipe,
    stderr: OutputPipe,
    control: Arc<UnitControl>,
) -> UnitOutcome {
    let interpreter = init_stdlib(InterpreterBuilder::new()).interpreter();
    let result = run_in_interpreter(
        &interpreter,
        code,
        runtime_handle,
        stdout.clone(),
        stderr.clone(),
        control,
    );
    stdout.close();
    stderr.close();
    match result {
        Ok((exit_code, failure)) if !failure.is_empty() => {
            tracing::debug!(exit_code, "submission rejected by compiler");
            UnitOutcome::rejected(failure)
        }
        Ok((exit_code, _)) => UnitOutcome::exited(exit_code.parse().ok()),
        Err(message) => {
            tracing::debug!(error = %message, "python harness aborted");
            UnitOutcome::exited(None)
        }
    }
}

fn run_in_interpreter(
    interpreter: &Interpreter,
    code: &str,
    runtime_handle: Handle,
    stdout: OutputPipe,
    stderr: OutputPipe,
    control: Arc<UnitControl>,
) -> std::result::Result<(String, String), String> {
    interpreter
        .enter(move |vm: &vm::VirtualMachine| -> vm::PyResult<(String, String)> {
            let scope = vm.new_scope_with_builtins();
            scope
                .globals
                .set_item("__sandbox_code", vm.ctx.new_str(code).into(), vm)?;

            let stdout_handle = runtime_handle.clone();
            let stdout_control = control.clone();
            let emit_stdout = vm.new_function(
                "__sandbox_emit_stdout",
                move |text: String| -> vm::PyResult<String> {
                    Ok(emit_status(stdout.write(&stdout_handle, &stdout_control, &text)))
                },
            );
            scope
                .globals
                .set_item("__sandbox_emit_stdout", emit_stdout.into(), vm)?;

            let stderr_handle = runtime_handle.clone();
            let stderr_control = control.clone();
            let emit_stderr = vm.new_function(
                "__sandbox_emit_stderr",
                move |text: String| -> vm::PyResult<String> {
                    Ok(emit_status(stderr.write(&stderr_handle, &stderr_control, &text)))
                },
            );
            scope
                .globals
                .set_item("__sandbox_emit_stderr", emit_stderr.into(), vm)?;

            let poll_control = control.clone();
            let poll = vm.new_function(
                "__sandbox_poll",
                move |_probe: String| -> vm::PyResult<String> {
                    Ok(if poll_control.should_run() { "run" } else { "stop" }.to_owned())
                },
            );
            scope.globals.set_item("__sandbox_poll", poll.into(), vm)?;

            vm.run_string(scope.clone(), HARNESS, "<sandbox_harness>".to_owned())?;

            Ok((
                get_string_from_scope(vm, &scope, "__sandbox_exit_code"),
                get_string_from_scope(vm, &scope, "__sandbox_failure"),
            ))
        })
        .map_err(|err: vm::PyRef<PyBaseException>| format!("python harness error: {err:?}"))
}

fn emit_status(written: bool) -> String {
    if written { "ok" } else { "closed" }.to_owned()
}

fn init_stdlib(builder: InterpreterBuilder) -> InterpreterBuilder {
    let defs = rustpython_stdlib::stdlib_module_defs(&builder.ctx);
    builder
        .add_native_modules(&defs)
        .add_frozen_modules(rustpython_pylib::FROZEN_STDLIB)
        .init_hook(set_frozen_stdlib_dir)
}

fn set_frozen_stdlib_dir(vm: &mut vm::VirtualMachine) {
    use rustpython_vm::common::rc::PyRc;

    if let Some(state) = PyRc::get_mut(&mut vm.state) {
        state.config.paths.stdlib_dir = Some(rustpython_pylib::LIB_PATH.to_owned());
    }
}

fn get_string_from_scope(vm: &vm::VirtualMachine, scope: &Scope, name: &str) -> String {
    scope
        .globals
        .get_item(name, vm)
        .ok()
        .and_then(|value| value.try_to_value::<String>(vm).ok())
        .unwrap_or_default()
}

struct InProcessUnit {
    control: Arc<UnitControl>,
    done: oneshot::Receiver<UnitOutcome>,
    outcome: Option<UnitOutcome>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    identifier: String,
}

#[async_trait]
impl ExecutionUnit for InProcessUnit {
    fn streams(&mut self) -> UnitStreams {
        UnitStreams {
            stdout: self.stdout.take().map(|s| Box::new(s) as OutputStream),
            stderr: self.stderr.take().map(|s| Box::new(s) as OutputStream),
        }
    }

    async fn wait(&mut self) -> Result<UnitOutcome> {
        if let Some(outcome) = &self.outcome {
            return Ok(outcome.clone());
        }
        if self.control.severed.load(Ordering::SeqCst) {
            let outcome = UnitOutcome::exited(None);
            self.outcome = Some(outcome.clone());
            return Ok(outcome);
        }
        let outcome = (&mut self.done).await.map_err(|_| {
            UnitError::Unavailable("python thread exited without reporting".to_owned())
        })?;
        self.outcome = Some(outcome.clone());
        Ok(outcome)
    }

    async fn terminate(&mut self, graceful: bool) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        self.control.interrupted.store(true, Ordering::SeqCst);
        if !graceful {
            self.control.severed.store(true, Ordering::SeqCst);
            tracing::warn!(unit = %self.identifier, "detaching python thread");
        }
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        if self.outcome.is_some() || self.control.severed.load(Ordering::SeqCst) {
            return false;
        }
        match self.done.try_recv() {
            Ok(outcome) => {
                self.outcome = Some(outcome);
                false
            }
            Err(oneshot::error::TryRecvError::Empty) => true,
            Err(oneshot::error::TryRecvError::Closed) => false,
        }
    }

    fn identifier(&self) -> String {
        self.identifier.clone()
    }
}
