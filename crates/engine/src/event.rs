use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Identifier of one execution. Unique per engine and, through the random
/// suffix, across engines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ExecutionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

#[derive(Debug, Default)]
pub struct IdGenerator {
    sequence: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ExecutionId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis());
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let salt: u32 = rand::rng().random();
        ExecutionId(format!("exec-{millis:x}-{sequence:x}-{salt:08x}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record of an execution's event stream, in the wire shape sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    ExecutionStart {
        execution_id: ExecutionId,
        message: String,
    },
    Stdout {
        execution_id: ExecutionId,
        content: String,
    },
    Stderr {
        execution_id: ExecutionId,
        content: String,
    },
    ExecutionComplete {
        execution_id: ExecutionId,
        message: String,
        exit_code: Option<i32>,
        success: bool,
    },
    Timeout {
        execution_id: ExecutionId,
        message: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<ExecutionId>,
        message: String,
    },
}

impl OutputEvent {
    pub fn line(execution_id: ExecutionId, stream: StreamKind, content: String) -> Self {
        match stream {
            StreamKind::Stdout => Self::Stdout {
                execution_id,
                content,
            },
            StreamKind::Stderr => Self::Stderr {
                execution_id,
                content,
            },
        }
    }

    /// Transport-level error that is not tied to any execution.
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::Error {
            execution_id: None,
            message: message.into(),
        }
    }

    pub fn execution_id(&self) -> Option<&ExecutionId> {
        match self {
            Self::ExecutionStart { execution_id, .. }
            | Self::Stdout { execution_id, .. }
            | Self::Stderr { execution_id, .. }
            | Self::ExecutionComplete { execution_id, .. }
            | Self::Timeout { execution_id, .. } => Some(execution_id),
            Self::Error { execution_id, .. } => execution_id.as_ref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ExecutionComplete { .. } | Self::Timeout { .. } | Self::Error { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecutionStart { .. } => "execution_start",
            Self::Stdout { .. } => "stdout",
            Self::Stderr { .. } => "stderr",
            Self::ExecutionComplete { .. } => "execution_complete",
            Self::Timeout { .. } => "timeout",
            Self::Error { .. } => "error",
        }
    }
}

/// Events a sink buffers before senders wait for the consumer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Destination for one execution's events.
///
/// The queue is bounded: a consumer that falls behind makes `send` wait, which
/// in turn stops the relays reading and lets the unit's pipes fill up. Sends
/// never fail from the engine's point of view; once the consumer has gone
/// away, events are dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::Sender<OutputEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::Receiver<OutputEvent>) {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub async fn send(&self, event: OutputEvent) {
        if self.sender.send(event).await.is_err() {
            tracing::debug!("event consumer dropped; discarding event");
        }
    }
}
