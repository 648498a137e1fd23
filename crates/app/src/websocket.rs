use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use engine::{Engine, EventSink, ExecutionId, OutputEvent};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::AppState;

const INVALID_JSON: &str = "Invalid JSON format. Please send properly formatted JSON data.";
const INVALID_FORMAT: &str =
    "Message format is invalid. Please send JSON with 'type' and 'code' fields.";

/// A message a client sends over `/ws/python`. A message without `type` is
/// an `execute`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Execute { code: String },
    Stop { execution_id: String },
}

pub fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    let mut value: Value = serde_json::from_str(text).map_err(|_| INVALID_JSON.to_owned())?;
    if let Value::Object(fields) = &mut value {
        fields
            .entry("type")
            .or_insert_with(|| Value::String("execute".to_owned()));
    }
    let message: ClientMessage =
        serde_json::from_value(value).map_err(|_| INVALID_FORMAT.to_owned())?;
    let blank = match &message {
        ClientMessage::Execute { code } => code.trim().is_empty(),
        ClientMessage::Stop { execution_id } => execution_id.trim().is_empty(),
    };
    if blank {
        return Err(INVALID_FORMAT.to_owned());
    }
    Ok(message)
}

/// Length is counted in characters, not bytes.
pub fn check_code_length(code: &str, max_code_length: usize) -> Result<(), String> {
    let length = code.chars().count();
    if length > max_code_length {
        return Err(format!(
            "Code is {length} characters, which is greater than the {max_code_length} characters allowed. Please submit a shorter string."
        ));
    }
    Ok(())
}

/// Executions started on one connection. Only these may be stopped from it.
#[derive(Debug, Default)]
struct OwnedExecutions {
    ids: HashSet<ExecutionId>,
}

impl OwnedExecutions {
    /// Tracks `execution_id`, forgetting executions that have since ended.
    fn insert(&mut self, engine: &Engine, execution_id: ExecutionId) {
        self.ids.retain(|owned| engine.is_active(owned));
        self.ids.insert(execution_id);
    }

    fn owns(&self, execution_id: &ExecutionId) -> bool {
        self.ids.contains(execution_id)
    }

    fn into_active(self, engine: &Engine) -> Vec<ExecutionId> {
        self.ids
            .into_iter()
            .filter(|execution_id| engine.is_active(execution_id))
            .collect()
    }
}

fn no_active_execution(execution_id: &ExecutionId) -> OutputEvent {
    OutputEvent::transport_error(format!("No active execution with ID {execution_id}."))
}

pub async fn python_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut events) = EventSink::channel();
    let mut started = OwnedExecutions::default();
    tracing::info!("websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode event");
                    continue;
                }
            };
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(_)) => {
                sink.send(OutputEvent::transport_error(INVALID_JSON)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                tracing::warn!(error = %err, "websocket receive failed");
                sink.send(OutputEvent::transport_error(format!(
                    "Server error occurred: {err}"
                )))
                .await;
                break;
            }
        };
        match parse_client_message(&text) {
            Ok(ClientMessage::Execute { code }) => {
                if let Err(message) = check_code_length(&code, state.max_code_length) {
                    sink.send(OutputEvent::transport_error(message)).await;
                    continue;
                }
                let (execution_id, _) = state.engine.submit_with_sink(code, sink.clone());
                started.insert(&state.engine, execution_id);
            }
            Ok(ClientMessage::Stop { execution_id }) => {
                let execution_id = ExecutionId::from(execution_id);
                if !started.owns(&execution_id) {
                    sink.send(no_active_execution(&execution_id)).await;
                    continue;
                }
                let engine = state.engine.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    if !engine.stop(&execution_id).await {
                        sink.send(no_active_execution(&execution_id)).await;
                    }
                });
            }
            Err(message) => sink.send(OutputEvent::transport_error(message)).await,
        }
    }

    let started = started.into_active(&state.engine);
    if !started.is_empty() {
        tracing::info!(count = started.len(), "stopping executions of closed websocket");
    }
    futures::future::join_all(started.iter().map(|execution_id| state.engine.stop(execution_id)))
        .await;
    writer.abort();
    tracing::info!("websocket disconnected");
}
