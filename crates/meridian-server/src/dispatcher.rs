//! Per-connection message pumps.
//!
//! [`Dispatcher::run`] drives a bidirectional connection: a reader that
//! decodes inbound JSON frames and hands each one to a spawned handler task,
//! and a writer that drains the connection's [`OutboundQueue`] in FIFO order.
//! [`push`] is the outbound-only variant for read-only streams.
//!
//! Teardown happens exactly once per connection: in-flight handler tasks
//! are aborted, the queue is closed (later sends are dropped), the sink is
//! closed and then the disconnect hook runs.

use std::future::Future;

use futures::{Sink, SinkExt, Stream, StreamExt};
use meridian_core::ConnectionId;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// Why a connection loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client closed the connection.
    Peer,
    /// Reading or writing failed.
    Transport(TransportError),
    /// Nothing is left to send.
    Drained,
    /// Process-wide shutdown.
    Shutdown,
}

/// Producer handle for a connection's outbound queue.
pub struct OutboundQueue<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for OutboundQueue<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> std::fmt::Debug for OutboundQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<T> OutboundQueue<T> {
    /// Enqueue an item. Returns false once the connection is torn down.
    pub fn send(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Bidirectional pump for one connection.
pub struct Dispatcher<T> {
    connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<T>,
    rx: mpsc::UnboundedReceiver<T>,
    shutdown: CancellationToken,
}

impl<T> Default for Dispatcher<T>
where
    T: Serialize,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Dispatcher<T>
where
    T: Serialize,
{
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connection_id: ConnectionId::new(),
            tx,
            rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop the connection when `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Id identifying this connection to routers and the session registry.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn queue(&self) -> OutboundQueue<T> {
        OutboundQueue { tx: self.tx.clone() }
    }

    /// Pump the connection until either side closes.
    ///
    /// Every inbound frame is decoded as JSON and passed to `on_receive` on a
    /// new task, so a slow handler never stalls reading. `on_disconnect`
    /// runs once, after all handler tasks have been cancelled.
    pub async fn run<St, Si, R, Fut, D, DFut>(
        self,
        mut stream: St,
        mut sink: Si,
        on_receive: R,
        on_disconnect: D,
    ) -> CloseReason
    where
        St: Stream<Item = Result<String, TransportError>> + Unpin,
        Si: Sink<String, Error = TransportError> + Unpin,
        R: Fn(Result<Value, serde_json::Error>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        D: FnOnce() -> DFut,
        DFut: Future<Output = ()>,
    {
        let Self {
            connection_id,
            tx,
            mut rx,
            shutdown,
        } = self;
        let mut tasks: JoinSet<()> = JoinSet::new();

        let reason = {
            let reader = async {
                loop {
                    match stream.next().await {
                        Some(Ok(text)) => {
                            tasks.spawn(on_receive(serde_json::from_str::<Value>(&text)));
                            reap(&mut tasks, connection_id);
                        }
                        Some(Err(TransportError::Closed)) | None => return CloseReason::Peer,
                        Some(Err(e)) => return CloseReason::Transport(e),
                    }
                }
            };

            let writer = async {
                while let Some(item) = rx.recv().await {
                    let text = match serde_json::to_string(&item) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Dropping unserializable message on {}: {}", connection_id, e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(text).await {
                        return CloseReason::Transport(e);
                    }
                }
                CloseReason::Drained
            };

            tokio::select! {
                reason = reader => reason,
                reason = writer => reason,
                _ = shutdown.cancelled() => CloseReason::Shutdown,
            }
        };

        drop(tx);
        rx.close();
        tasks.shutdown().await;
        let _ = sink.close().await;

        match &reason {
            CloseReason::Transport(e) => tracing::warn!("Connection {} failed: {}", connection_id, e),
            other => tracing::info!("Connection {} closed ({:?})", connection_id, other),
        }
        on_disconnect().await;
        reason
    }
}

fn reap(tasks: &mut JoinSet<()>, connection_id: ConnectionId) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("Command handler on {} panicked", connection_id);
            }
        }
    }
}

/// Forward text messages from `rx` to the client until the client goes
/// away, `rx` closes or `shutdown` fires. Inbound frames are ignored.
pub async fn push<St, Si>(
    mut stream: St,
    mut sink: Si,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
) -> CloseReason
where
    St: Stream<Item = Result<String, TransportError>> + Unpin,
    Si: Sink<String, Error = TransportError> + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break CloseReason::Shutdown,
            inbound = stream.next() => match inbound {
                Some(Ok(_)) => {}
                Some(Err(TransportError::Closed)) | None => break CloseReason::Peer,
                Some(Err(e)) => break CloseReason::Transport(e),
            },
            outbound = rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        break CloseReason::Transport(e);
                    }
                }
                None => break CloseReason::Drained,
            },
        }
    };

    rx.close();
    let _ = sink.close().await;
    tracing::debug!("Push stream closed ({:?})", reason);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as channel;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    type Inbound = channel::UnboundedSender<Result<String, TransportError>>;
    type Outbound = channel::UnboundedReceiver<String>;

    fn transport() -> (
        Inbound,
        channel::UnboundedReceiver<Result<String, TransportError>>,
        impl Sink<String, Error = TransportError> + Unpin + Send,
        Outbound,
    ) {
        let (in_tx, in_rx) = channel::unbounded();
        let (out_tx, out_rx) = channel::unbounded::<String>();
        let sink = out_tx.sink_map_err(|_| TransportError::Closed);
        (in_tx, in_rx, sink, out_rx)
    }

    async fn next_text(out: &mut Outbound) -> String {
        tokio::time::timeout(Duration::from_secs(2), out.next())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("outbound closed")
    }

    #[tokio::test]
    async fn test_echo_in_order_and_disconnect_once() {
        let (in_tx, in_rx, sink, mut out) = transport();
        let dispatcher = Dispatcher::<Value>::new();
        let queue = dispatcher.queue();
        let disconnects = Arc::new(AtomicUsize::new(0));

        let hook = disconnects.clone();
        let task = tokio::spawn(dispatcher.run(
            in_rx,
            sink,
            move |message| {
                let queue = queue.clone();
                async move {
                    match message {
                        Ok(value) => queue.send(value),
                        Err(_) => queue.send(Value::String("invalid".to_string())),
                    };
                }
            },
            move || async move {
                hook.fetch_add(1, Ordering::SeqCst);
            },
        ));

        in_tx.unbounded_send(Ok("{\"n\": 1}".to_string())).unwrap();
        assert_eq!(next_text(&mut out).await, "{\"n\":1}");
        in_tx.unbounded_send(Ok("not json".to_string())).unwrap();
        assert_eq!(next_text(&mut out).await, "\"invalid\"");

        drop(in_tx);
        assert_eq!(task.await.unwrap(), CloseReason::Peer);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_writer_preserves_enqueue_order() {
        let (in_tx, in_rx, sink, mut out) = transport();
        let dispatcher = Dispatcher::<u32>::new();
        let queue = dispatcher.queue();
        for n in 0..50 {
            assert!(queue.send(n));
        }

        let task = tokio::spawn(dispatcher.run(in_rx, sink, |_| async {}, || async {}));
        for n in 0..50 {
            assert_eq!(next_text(&mut out).await, n.to_string());
        }

        in_tx.unbounded_send(Err(TransportError::Closed)).unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Peer);
        assert!(!queue.send(99));
        assert!(queue.is_closed());
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_reads_and_is_cancelled() {
        let (in_tx, in_rx, sink, mut out) = transport();
        let dispatcher = Dispatcher::<String>::new();
        let queue = dispatcher.queue();
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = cancelled.clone();
        let task = tokio::spawn(dispatcher.run(
            in_rx,
            sink,
            move |message| {
                let queue = queue.clone();
                let flag = flag.clone();
                async move {
                    let value = message.unwrap();
                    if value == "slow" {
                        let _guard = DropFlag(flag);
                        std::future::pending::<()>().await;
                    }
                    queue.send(value.as_str().unwrap_or_default().to_string());
                }
            },
            || async {},
        ));

        in_tx.unbounded_send(Ok("\"slow\"".to_string())).unwrap();
        in_tx.unbounded_send(Ok("\"fast\"".to_string())).unwrap();
        assert_eq!(next_text(&mut out).await, "\"fast\"");

        drop(in_tx);
        task.await.unwrap();
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_failure_tears_down() {
        let (_in_tx, in_rx, sink, out) = transport();
        drop(out);
        let dispatcher = Dispatcher::<u32>::new();
        dispatcher.queue().send(1);

        let reason = dispatcher.run(in_rx, sink, |_| async {}, || async {}).await;
        assert_eq!(reason, CloseReason::Transport(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_token_stops_pump() {
        let (_in_tx, in_rx, sink, _out) = transport();
        let token = CancellationToken::new();
        let dispatcher = Dispatcher::<u32>::new().with_shutdown(token.clone());
        token.cancel();

        let reason = dispatcher.run(in_rx, sink, |_| async {}, || async {}).await;
        assert_eq!(reason, CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_push_forwards_until_shutdown() {
        let (_in_tx, in_rx, sink, mut out) = transport();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let task = tokio::spawn(push(in_rx, sink, rx, token.clone()));
        tx.send("a".to_string()).unwrap();
        tx.send("b".to_string()).unwrap();
        assert_eq!(next_text(&mut out).await, "a");
        assert_eq!(next_text(&mut out).await, "b");

        token.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Shutdown);
        assert!(tx.send("c".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_push_stops_when_client_closes() {
        let (in_tx, in_rx, sink, _out) = transport();
        let (_tx, rx) = mpsc::unbounded_channel::<String>();

        in_tx.unbounded_send(Ok("ignored".to_string())).unwrap();
        in_tx.unbounded_send(Err(TransportError::Closed)).unwrap();
        let reason = push(in_rx, sink, rx, CancellationToken::new()).await;
        assert_eq!(reason, CloseReason::Peer);
    }
}
