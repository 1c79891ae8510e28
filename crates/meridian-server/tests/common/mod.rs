//! Shared fakes for channel integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, StreamExt};
use meridian_core::{
    EventBus, Event, KernelChannel, KernelError, KernelManager, KernelOptions, MessageId, SessionId,
};
use meridian_server::{AppState, ServerConfig, TransportError};
use serde_json::{Value, json};

/// Package list printed by the fake dependency kernel.
pub const PACKAGE_LIST: &str = r#"[{"name": "numpy", "version": "1.26.4"}]"#;

/// Kernel manager that answers every execute with a package listing.
pub struct ScriptedKernels {
    bus: EventBus,
    pub starts: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub fail_start: AtomicBool,
    /// Take a while to become ready after starting.
    pub slow_start: AtomicBool,
    /// Accept executes but never answer them.
    pub hang: AtomicBool,
    pub executed: Mutex<Vec<String>>,
}

impl ScriptedKernels {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            starts: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            slow_start: AtomicBool::new(false),
            hang: AtomicBool::new(false),
            executed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl KernelManager for ScriptedKernels {
    async fn start_kernel(&self, _: &str, _: SessionId, _: &KernelOptions) -> Result<(), KernelError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(KernelError::Spawn("interpreter not found".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.slow_start.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    async fn execute(&self, session_id: SessionId, message_id: MessageId, source: &str) -> Result<(), KernelError> {
        self.executed.lock().unwrap().push(source.to_string());
        if self.hang.load(Ordering::SeqCst) {
            return Ok(());
        }

        let bus = self.bus.clone();
        tokio::spawn(async move {
            let message = |channel, msg_type: &str, content: Value| Event::KernelMessage {
                kernel_spec: "python3".to_string(),
                session_id,
                channel,
                parent_id: Some(message_id),
                msg_type: msg_type.to_string(),
                content,
            };
            bus.publish(message(
                KernelChannel::Iopub,
                "stream",
                json!({ "name": "stdout", "text": format!("{}\n", PACKAGE_LIST) }),
            ));
            bus.publish(message(KernelChannel::Shell, "execute_reply", json!({ "status": "ok" })));
        });
        Ok(())
    }

    async fn shutdown_kernel(&self, _: SessionId) -> Result<(), KernelError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn app_state() -> (Arc<ScriptedKernels>, Arc<AppState>) {
    let bus = EventBus::new();
    let kernels = Arc::new(ScriptedKernels::new(bus.clone()));
    let state = AppState::new(ServerConfig::default(), bus, kernels.clone());
    (kernels, Arc::new(state))
}

/// Client half of an in-memory connection.
pub struct Client {
    pub tx: mpsc::UnboundedSender<Result<String, TransportError>>,
    pub rx: mpsc::UnboundedReceiver<String>,
}

/// Server half of an in-memory connection.
pub type ServerStream = mpsc::UnboundedReceiver<Result<String, TransportError>>;

pub fn connection() -> (
    Client,
    ServerStream,
    impl Sink<String, Error = TransportError> + Unpin + Send + 'static,
) {
    let (in_tx, in_rx) = mpsc::unbounded();
    let (out_tx, out_rx) = mpsc::unbounded::<String>();
    let sink = out_tx.sink_map_err(|_| TransportError::Closed);
    (Client { tx: in_tx, rx: out_rx }, in_rx, sink)
}

impl Client {
    pub fn send(&self, message: Value) {
        self.tx.unbounded_send(Ok(message.to_string())).unwrap();
    }

    pub fn send_raw(&self, text: &str) {
        self.tx.unbounded_send(Ok(text.to_string())).unwrap();
    }

    /// Next frame from the server, parsed as JSON.
    pub async fn recv(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.rx.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("server closed the connection");
        serde_json::from_str(&text).unwrap()
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Value> {
        match tokio::time::timeout(wait, self.rx.next()).await {
            Ok(Some(text)) => Some(serde_json::from_str(&text).unwrap()),
            Ok(None) | Err(_) => None,
        }
    }

    /// Close the client side and collect whatever the server still wrote.
    pub async fn close(self) -> Vec<String> {
        let Client { tx, rx } = self;
        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), rx.collect::<Vec<_>>())
            .await
            .expect("server did not close its side")
    }
}
