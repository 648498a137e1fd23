//! Streaming execution of untrusted Python snippets.
//!
//! An [`Engine`] turns a submission into one [`ExecutionUnit`](unit::ExecutionUnit),
//! relays the unit's stdout/stderr line by line as [`OutputEvent`]s, enforces
//! a wall-clock timeout, and tears the unit down on every exit path.

pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod registry;
pub mod relay;
pub mod unit;

pub use config::{EngineConfig, StrategyKind};
pub use engine::{Engine, START_MESSAGE, Submission};
pub use error::{ConfigError, UnitError};
pub use event::{EventSink, ExecutionId, OutputEvent, StreamKind};
pub use registry::{ActiveExecution, ExecutionStatus};
pub use unit::delegated::{
    DelegatedStrategy, ExecutionBackend, TaskId, TaskResult, TaskState, TaskStatus,
};
#[cfg(feature = "in-process")]
pub use unit::in_process::InProcessStrategy;
pub use unit::subprocess::SubprocessStrategy;
pub use unit::{ExecutionStrategy, ExecutionUnit, UnitOutcome, UnitStreams};
