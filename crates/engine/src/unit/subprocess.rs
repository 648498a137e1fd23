use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tempfile::NamedTempFile;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use super::{ExecutionStrategy, ExecutionUnit, OutputStream, UnitOutcome, UnitStreams};
use crate::config::{DEFAULT_PYTHON_BIN, DEFAULT_SETUP_TIMEOUT_SECONDS};
use crate::error::{Result, UnitError};

const COMPILE_CHECK: &str = r#"import sys
with open(sys.argv[1], encoding="utf-8", errors="replace") as handle:
    source = handle.read()
try:
    compile(source, "<submission>", "exec")
except (SyntaxError, ValueError) as exc:
    print(f"{type(exc).__name__}: {exc}", file=sys.stderr)
    sys.exit(2)
"#;

/// Exit status the compile check uses for "does not compile".
const COMPILE_REJECTED: i32 = 2;

/// Runs each submission in a fresh interpreter process.
#[derive(Debug, Clone)]
pub struct SubprocessStrategy {
    python_bin: PathBuf,
    setup_timeout: Duration,
}

impl Default for SubprocessStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_PYTHON_BIN)
    }
}

impl SubprocessStrategy {
    pub fn new(python_bin: impl Into<PathBuf>) -> Self {
        Self {
            python_bin: python_bin.into(),
            setup_timeout: Duration::from_secs(DEFAULT_SETUP_TIMEOUT_SECONDS),
        }
    }

    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    pub fn python_bin(&self) -> &Path {
        &self.python_bin
    }

    async fn compile_check(&self, script: &Path) -> Result<()> {
        let output = Command::new(&self.python_bin)
            .arg("-c")
            .arg(COMPILE_CHECK)
            .arg(script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.setup_timeout, output).await {
            Ok(output) => output.map_err(UnitError::Spawn)?,
            Err(_) => {
                return Err(UnitError::Unavailable(format!(
                    "compile check did not finish within {}s",
                    self.setup_timeout.as_secs_f64()
                )));
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("submission does not compile")
            .trim()
            .to_owned();
        if output.status.code() == Some(COMPILE_REJECTED) {
            Err(UnitError::Rejected(detail))
        } else {
            Err(UnitError::Unavailable(format!("compile check failed: {detail}")))
        }
    }
}

#[async_trait]
impl ExecutionStrategy for SubprocessStrategy {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn start(&self, code: &str) -> Result<Box<dyn ExecutionUnit>> {
        let script = write_script(code)?;
        self.compile_check(script.path()).await?;

        let mut command = Command::new(&self.python_bin);
        command
            .arg("-u")
            .arg(script.path())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        let mut child = command.spawn().map_err(UnitError::Spawn)?;
        let pid = child
            .id()
            .ok_or_else(|| UnitError::Unavailable("interpreter exited before it was tracked".to_owned()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tracing::debug!(pid, script = %script.path().display(), "interpreter spawned");
        Ok(Box::new(SubprocessUnit {
            child,
            pid,
            stdout,
            stderr,
            outcome: None,
            _script: script,
        }))
    }
}

fn write_script(code: &str) -> Result<NamedTempFile> {
    let mut script = tempfile::Builder::new()
        .prefix("submission-")
        .suffix(".py")
        .tempfile()?;
    script.write_all(code.as_bytes())?;
    script.flush()?;
    Ok(script)
}

struct SubprocessUnit {
    child: Child,
    pid: u32,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    outcome: Option<UnitOutcome>,
    // Removed from disk when the unit is dropped.
    _script: NamedTempFile,
}

impl SubprocessUnit {
    fn signal_group(&self, signal: Signal) -> Result<()> {
        let pgid = i32::try_from(self.pid)
            .map_err(|_| UnitError::Terminate(format!("pid {} out of range", self.pid)))?;
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(UnitError::Terminate(format!(
                "{} to process group {pgid}: {err}",
                signal.as_str()
            ))),
        }
    }

    /// Records the interpreter's exit and kills whatever it left behind in
    /// its process group, so no descendant outlives the unit or keeps the
    /// output pipes open.
    fn record_exit(&mut self, status: ExitStatus) -> UnitOutcome {
        let outcome = UnitOutcome::exited(exit_code(status));
        self.outcome = Some(outcome.clone());
        if let Err(err) = self.signal_group(Signal::SIGKILL) {
            tracing::warn!(pid = self.pid, error = %err, "failed to reap process group");
        }
        outcome
    }
}

impl Drop for SubprocessUnit {
    fn drop(&mut self) {
        // Until the leader is reaped its pid still names this group.
        if self.outcome.is_none() {
            let _ = self.signal_group(Signal::SIGKILL);
        }
    }
}

#[async_trait]
impl ExecutionUnit for SubprocessUnit {
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
        let status = self.child.wait().await?;
        Ok(self.record_exit(status))
    }

    async fn terminate(&mut self, graceful: bool) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }
        if graceful {
            return self.signal_group(Signal::SIGINT);
        }
        let group = self.signal_group(Signal::SIGKILL);
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(pid = self.pid, error = %err, "start_kill after group kill");
        }
        group
    }

    fn is_alive(&mut self) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Err(_) => false,
        }
    }

    fn identifier(&self) -> String {
        format!("pid:{}", self.pid)
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    if let Some(signal) = status.signal() {
        tracing::debug!(signal, "interpreter ended by signal");
    }
    status.code()
}
