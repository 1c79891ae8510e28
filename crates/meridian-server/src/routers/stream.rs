//! Raw kernel message stream.
//!
//! Read-only: every kernel message of one kernel spec is pushed to the
//! client with its kernel channel attached, multiplexing all channels over
//! one socket.

use std::sync::Arc;

use futures::{Sink, Stream};
use meridian_core::{Event, EventKind};
use serde_json::json;
use tokio::sync::mpsc;

use crate::dispatcher::{CloseReason, push};
use crate::routes::AppState;
use crate::transport::TransportError;

/// Stream kernel messages for `kernel_spec` until the client goes away.
pub async fn serve<St, Si>(state: Arc<AppState>, kernel_spec: String, stream: St, sink: Si) -> CloseReason
where
    St: Stream<Item = Result<String, TransportError>> + Unpin,
    Si: Sink<String, Error = TransportError> + Unpin,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let spec = kernel_spec.clone();
    let _subscription = state.bus.subscribe(EventKind::KernelMessage, move |event| {
        if let Event::KernelMessage {
            kernel_spec,
            session_id,
            channel,
            parent_id,
            msg_type,
            content,
        } = event
        {
            if *kernel_spec == spec {
                let message = json!({
                    "channel": channel,
                    "msg_type": msg_type,
                    "session": session_id,
                    "parent_header": { "msg_id": parent_id },
                    "content": content,
                });
                let _ = tx.send(message.to_string());
            }
        }
        Ok(())
    });

    tracing::info!("Kernel stream for '{}' opened", kernel_spec);
    push(stream, sink, rx, state.shutdown.clone()).await
}
