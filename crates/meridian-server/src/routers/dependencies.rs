//! Dependency-install channel.
//!
//! Request/reply protocol: every inbound [`DependencyRequest`] is answered
//! with `received`, any number of `update`s and exactly one `complete` or
//! `failed`, all carrying the client's `request_id`. A malformed request is
//! answered with a single `failed` and nothing else.
//!
//! Status events travel over the bus stamped with the issuing connection.
//! Each connection forwards only its own events, and only for request ids
//! still in its allow-list.

use std::sync::{Arc, Mutex, PoisonError};

use futures::{Sink, Stream};
use meridian_core::{ConnectionId, Event, EventKind, MessageId, SessionId, Subscription};
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::dispatcher::{CloseReason, Dispatcher, OutboundQueue};
use crate::error::ServerResult;
use crate::protocol::{DependencyRequest, DependencyStatus};
use crate::routes::AppState;
use crate::transport::TransportError;

const STATUS_EVENTS: [EventKind; 4] = [
    EventKind::DependencyReceived,
    EventKind::DependencyUpdate,
    EventKind::DependencyComplete,
    EventKind::DependencyFailed,
];

/// Serve one dependency connection until it closes.
pub async fn serve<St, Si>(state: Arc<AppState>, stream: St, sink: Si) -> CloseReason
where
    St: Stream<Item = Result<String, TransportError>> + Unpin,
    Si: Sink<String, Error = TransportError> + Unpin,
{
    let dispatcher = Dispatcher::<DependencyStatus>::new().with_shutdown(state.shutdown.clone());
    let channel = Arc::new(DependencyChannel {
        state,
        connection: dispatcher.connection_id(),
        queue: dispatcher.queue(),
        pending: Arc::new(Mutex::new(FxHashSet::default())),
        tracked: Mutex::new(Vec::new()),
        session: OnceCell::new(),
    });
    let subscriptions = channel.subscribe();
    tracing::info!("Dependency channel opened ({})", channel.connection);

    let receiver = channel.clone();
    dispatcher
        .run(
            stream,
            sink,
            move |message| {
                let channel = receiver.clone();
                async move { channel.handle(message).await }
            },
            move || async move {
                drop(subscriptions);
                channel.detach().await;
            },
        )
        .await
}

type Pending = Arc<Mutex<FxHashSet<String>>>;

struct DependencyChannel {
    state: Arc<AppState>,
    connection: ConnectionId,
    queue: OutboundQueue<DependencyStatus>,
    /// Request ids issued on this connection and not yet finished.
    pending: Pending,
    /// Execute requests handed to the monitor by this connection.
    tracked: Mutex<Vec<MessageId>>,
    /// Set once this connection is attached to the dependency kernel.
    session: OnceCell<SessionId>,
}

impl DependencyChannel {
    fn subscribe(&self) -> Vec<Subscription> {
        STATUS_EVENTS
            .into_iter()
            .map(|kind| {
                let connection = self.connection;
                let pending = self.pending.clone();
                let queue = self.queue.clone();
                self.state
                    .bus
                    .subscribe(kind, move |event| forward(connection, &pending, &queue, event))
            })
            .collect()
    }

    async fn handle(&self, message: Result<Value, serde_json::Error>) {
        let request = match self.parse(message) {
            Ok(request) => request,
            Err(rejection) => {
                tracing::warn!("Rejected dependency command on {}: {:?}", self.connection, rejection);
                self.queue.send(rejection);
                return;
            }
        };

        let request_id = request.request_id.clone();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone());
        self.state.bus.publish(Event::DependencyReceived {
            connection_id: self.connection,
            request_id: request_id.clone(),
        });

        if let Err(e) = self.execute(&request).await {
            tracing::warn!("Dependency command {} failed: {}", request_id, e);
            self.state.bus.publish(Event::DependencyFailed {
                connection_id: self.connection,
                request_id,
                info: e.to_string(),
            });
        }
    }

    fn parse(&self, message: Result<Value, serde_json::Error>) -> Result<DependencyRequest, DependencyStatus> {
        let failed = |request_id: &str, info: String| DependencyStatus::Failed {
            request_id: request_id.to_string(),
            info,
        };

        let value = message.map_err(|e| failed(DependencyStatus::UNKNOWN_REQUEST, format!("Invalid message: {}", e)))?;
        let recovered = value
            .get("request_id")
            .and_then(Value::as_str)
            .unwrap_or(DependencyStatus::UNKNOWN_REQUEST)
            .to_string();
        let request: DependencyRequest =
            serde_json::from_value(value).map_err(|e| failed(&recovered, format!("Invalid request: {}", e)))?;

        let allowed = &self.state.config.dependency.allowed_commands;
        if !allowed.iter().any(|command| *command == request.command) {
            return Err(failed(
                &request.request_id,
                format!("Command '{}' is not allowed", request.command),
            ));
        }
        Ok(request)
    }

    async fn execute(&self, request: &DependencyRequest) -> ServerResult<()> {
        let config = &self.state.config.dependency;
        let options = config.kernel_options();
        self.session
            .get_or_try_init(|| self.state.registry.connect(&config.kernel_spec, self.connection, &options))
            .await?;

        let message_id = MessageId::new();
        self.state
            .monitor
            .track(message_id, self.connection, request.request_id.clone());
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message_id);

        let command = request.command_line();
        tracing::info!("Running dependency command {}: {}", request.request_id, command);
        if let Err(e) = self
            .state
            .registry
            .execute_as(&config.kernel_spec, message_id, &command)
            .await
        {
            self.state.monitor.untrack(message_id);
            return Err(e.into());
        }
        Ok(())
    }

    /// Release everything this connection holds outside of itself.
    ///
    /// Always detaches from the registry: an aborted command may have left
    /// a kernel start running that attaches this connection after the fact.
    async fn detach(&self) {
        let tracked = std::mem::take(&mut *self.tracked.lock().unwrap_or_else(PoisonError::into_inner));
        for message_id in tracked {
            self.state.monitor.untrack(message_id);
        }

        let kernel_spec = &self.state.config.dependency.kernel_spec;
        if let Err(e) = self.state.registry.disconnect(kernel_spec, self.connection).await {
            tracing::warn!("Failed to detach {} from '{}': {}", self.connection, kernel_spec, e);
        }
    }
}

/// Enqueue a status event if its request was issued on this connection.
fn forward(
    connection: ConnectionId,
    pending: &Pending,
    queue: &OutboundQueue<DependencyStatus>,
    event: &Event,
) -> Result<(), meridian_core::HandlerError> {
    if event.connection_id() != Some(connection) {
        return Ok(());
    }
    let Some(status) = DependencyStatus::from_event(event) else {
        return Ok(());
    };
    {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.contains(status.request_id()) {
            return Ok(());
        }
        if status.is_terminal() {
            pending.remove(status.request_id());
        }
    }
    tracing::debug!("Forwarding {} status for {}", event.kind(), status.request_id());
    queue.send(status);
    Ok(())
}
