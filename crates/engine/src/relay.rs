use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{EventSink, ExecutionId, OutputEvent, StreamKind};

/// Forwards every non-blank line of `stream` to `sink`, tagged with `kind`.
///
/// Invalid UTF-8 is replaced rather than rejected and trailing whitespace is
/// stripped. An absent stream forwards nothing. Nothing more is read while
/// the sink is full. Returns the number of lines forwarded once the stream
/// reaches end-of-file.
pub async fn relay<R>(
    stream: Option<R>,
    sink: &EventSink,
    execution_id: &ExecutionId,
    kind: StreamKind,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return Ok(0);
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    let mut forwarded = 0usize;
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            return Ok(forwarded);
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        sink.send(OutputEvent::line(
            execution_id.clone(),
            kind,
            line.to_owned(),
        ))
        .await;
        forwarded += 1;
    }
}

/// Runs [`relay`] on its own task. A read failure is reported once on
/// `faults` instead of being emitted as an event, so the owner of the
/// execution stays in charge of the terminal event.
pub fn spawn_relay<R>(
    stream: Option<R>,
    sink: EventSink,
    execution_id: ExecutionId,
    kind: StreamKind,
    faults: mpsc::UnboundedSender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match relay(stream, &sink, &execution_id, kind).await {
            Ok(lines) => {
                tracing::debug!(execution_id = %execution_id, stream = %kind, lines, "relay drained");
            }
            Err(err) => {
                tracing::warn!(execution_id = %execution_id, stream = %kind, error = %err, "relay failed");
                let _ = faults.send(format!(
                    "Error occurred while streaming {kind} output: {err}. Please try again."
                ));
            }
        }
    })
}
