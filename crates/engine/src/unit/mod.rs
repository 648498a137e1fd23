pub mod delegated;
#[cfg(feature = "in-process")]
pub mod in_process;
pub mod subprocess;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Readers for a unit's live output. Either side may be absent, e.g. for
/// backends that only report buffered output.
#[derive(Default)]
pub struct UnitStreams {
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

/// How a unit finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    /// `None` when the unit was ended by a signal or detached.
    pub exit_code: Option<i32>,
    /// Output that was buffered by the unit rather than streamed.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Set when the unit refused to run the submission at all.
    pub failure: Option<String>,
}

impl UnitOutcome {
    pub fn exited(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn rejected(failure: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            failure: Some(failure.into()),
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.failure.is_none() && self.exit_code == Some(0)
    }

    pub fn summary(&self) -> String {
        match self.exit_code {
            Some(0) => "Execution completed with exit code: 0. Success!".to_owned(),
            Some(code) => format!(
                "Execution completed with exit code: {code}. Code completed but may have encountered errors."
            ),
            None => "Execution ended without an exit code. Code completed but may have encountered errors."
                .to_owned(),
        }
    }
}

/// One running submission.
///
/// `wait` must be cancel-safe: the engine races it against the deadline and
/// calls it again after a termination request.
#[async_trait]
pub trait ExecutionUnit: Send {
    /// Hands out the output readers. Later calls return empty streams.
    fn streams(&mut self) -> UnitStreams;

    async fn wait(&mut self) -> Result<UnitOutcome>;

    /// `graceful` asks the payload to stop; otherwise the unit is killed
    /// without cooperation.
    async fn terminate(&mut self, graceful: bool) -> Result<()>;

    fn is_alive(&mut self) -> bool;

    fn identifier(&self) -> String;
}

#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, code: &str) -> Result<Box<dyn ExecutionUnit>>;
}
