//! Notebook streaming channel.
//!
//! Fans notebook events for one notebook into one connection, each wrapped
//! under a single key (see [`NotebookMessage`]). Replies to per-tab requests
//! (paging, completion, history) carry a connection id and only reach the
//! connection that asked.
//!
//! The only inbound command is `complete`; failures are answered with an
//! `error` message carrying the command's `command_id`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Sink, Stream};
use meridian_core::{ConnectionId, Event, EventKind, NotebookId, Subscription};
use serde_json::Value;

use crate::dispatcher::{CloseReason, Dispatcher, OutboundQueue};
use crate::error::{ServerError, ServerResult};
use crate::protocol::{CompleteRequest, NotebookCommand, NotebookMessage};
use crate::routes::AppState;
use crate::transport::TransportError;

/// External owner of notebook documents and their kernels.
#[async_trait]
pub trait NotebookManager: Send + Sync + 'static {
    /// Request code completion. The answer is published later as
    /// [`Event::CompleteReply`] addressed to `connection_id`.
    async fn complete(
        &self,
        notebook_id: NotebookId,
        request: CompleteRequest,
        connection_id: ConnectionId,
        command_id: Option<String>,
    ) -> ServerResult<()>;
}

const NOTEBOOK_EVENTS: [EventKind; 17] = [
    EventKind::CellUpdate,
    EventKind::CellUpdatePatch,
    EventKind::CellAdded,
    EventKind::CellDeleted,
    EventKind::CellExecutionReply,
    EventKind::CellExecutionInput,
    EventKind::CellExecutionRequest,
    EventKind::ScratchUpdate,
    EventKind::VarsUpdate,
    EventKind::ImportError,
    EventKind::PayloadPage,
    EventKind::CompleteReply,
    EventKind::HistoryReply,
    EventKind::MetadataUpdate,
    EventKind::KernelRestarted,
    EventKind::KernelInterrupted,
    EventKind::ClientCommand,
];

/// Serve one notebook connection until it closes.
pub async fn serve<St, Si>(state: Arc<AppState>, notebook_id: NotebookId, stream: St, sink: Si) -> CloseReason
where
    St: Stream<Item = Result<String, TransportError>> + Unpin,
    Si: Sink<String, Error = TransportError> + Unpin,
{
    let dispatcher = Dispatcher::<NotebookMessage>::new().with_shutdown(state.shutdown.clone());
    let connection = dispatcher.connection_id();
    let queue = dispatcher.queue();

    let subscriptions: Vec<Subscription> = NOTEBOOK_EVENTS
        .into_iter()
        .map(|kind| {
            let queue = queue.clone();
            state.bus.subscribe(kind, move |event| {
                if routes_to(event, notebook_id, connection) {
                    if let Some(message) = NotebookMessage::from_event(event) {
                        tracing::debug!("Forwarding {} to {}", message.key(), connection);
                        queue.send(message);
                    }
                }
                Ok(())
            })
        })
        .collect();
    tracing::info!("Notebook {} connected ({})", notebook_id, connection);

    dispatcher
        .run(
            stream,
            sink,
            move |message| {
                let state = state.clone();
                let queue = queue.clone();
                async move { handle_command(&state, notebook_id, connection, message, &queue).await }
            },
            move || async move {
                drop(subscriptions);
                tracing::info!("Notebook {} disconnected ({})", notebook_id, connection);
            },
        )
        .await
}

fn routes_to(event: &Event, notebook_id: NotebookId, connection: ConnectionId) -> bool {
    event.notebook_id() == Some(notebook_id) && event.connection_id().is_none_or(|target| target == connection)
}

#[derive(Debug, thiserror::Error)]
enum CommandError {
    #[error("invalid message: {0}")]
    Message(serde_json::Error),

    #[error("invalid body: {0}")]
    Body(serde_json::Error),

    #[error(transparent)]
    Server(#[from] ServerError),
}

async fn handle_command(
    state: &AppState,
    notebook_id: NotebookId,
    connection: ConnectionId,
    message: Result<Value, serde_json::Error>,
    queue: &OutboundQueue<NotebookMessage>,
) {
    let command_id = message
        .as_ref()
        .ok()
        .and_then(|value| value.get("command_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    if let Err(e) = dispatch(state, notebook_id, connection, message).await {
        tracing::warn!("Failed to process notebook command on {}: {}", connection, e);
        queue.send(error_message(e, command_id));
    }
}

async fn dispatch(
    state: &AppState,
    notebook_id: NotebookId,
    connection: ConnectionId,
    message: Result<Value, serde_json::Error>,
) -> Result<(), CommandError> {
    let value = message.map_err(CommandError::Message)?;
    let command: NotebookCommand = serde_json::from_value(value).map_err(CommandError::Message)?;

    match command.command.as_deref() {
        Some("complete") => {
            let request: CompleteRequest = serde_json::from_value(command.body).map_err(CommandError::Body)?;
            let notebooks = state
                .notebooks
                .as_ref()
                .ok_or_else(|| ServerError::Notebook("no notebook manager configured".to_string()))?;
            notebooks
                .complete(notebook_id, request, connection, command.command_id)
                .await?;
            Ok(())
        }
        other => Err(ServerError::UnsupportedCommand(other.unwrap_or_default().to_string()).into()),
    }
}

fn error_message(error: CommandError, command_id: Option<String>) -> NotebookMessage {
    let (message, detail) = match error {
        CommandError::Body(e) => (
            "Error processing incoming command, invalid body".to_string(),
            Some(Value::String(e.to_string())),
        ),
        CommandError::Server(ServerError::UnsupportedCommand(name)) => {
            (format!("Command '{}' is not supported", name), None)
        }
        CommandError::Message(_) | CommandError::Server(_) => ("Error processing incoming command".to_string(), None),
    };
    NotebookMessage::Error {
        message,
        command_id,
        detail,
    }
}
