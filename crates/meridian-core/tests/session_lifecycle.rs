//! Integration tests for kernel session reference counting.
//!
//! Drives `SessionRegistry` against a recording kernel manager and checks
//! that kernels start and stop exactly when the connection set changes
//! between empty and non-empty.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meridian_core::{
    ConnectionId, Event, EventBus, EventKind, KernelError, KernelManager, KernelOptions, MessageId,
    SessionId, SessionRegistry, ShellKernels,
};

/// Kernel manager that records every call and sleeps inside start and
/// shutdown so concurrent callers interleave.
#[derive(Default)]
struct RecordingKernels {
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
    started: Mutex<Vec<SessionId>>,
}

#[async_trait]
impl KernelManager for RecordingKernels {
    async fn start_kernel(&self, _: &str, session_id: SessionId, _: &KernelOptions) -> Result<(), KernelError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(session_id);
        Ok(())
    }

    async fn execute(&self, _: SessionId, _: MessageId, _: &str) -> Result<(), KernelError> {
        Ok(())
    }

    async fn shutdown_kernel(&self, _: SessionId) -> Result<(), KernelError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn setup() -> (Arc<RecordingKernels>, Arc<SessionRegistry>) {
    let kernels = Arc::new(RecordingKernels::default());
    let registry = Arc::new(SessionRegistry::new(kernels.clone()));
    (kernels, registry)
}

#[tokio::test]
async fn test_shared_session_survives_until_last_disconnect() {
    let (kernels, registry) = setup();
    let opts = KernelOptions::default();
    let (ws1, ws2) = (ConnectionId::new(), ConnectionId::new());

    registry.connect("python", ws1, &opts).await.unwrap();
    registry.connect("python", ws2, &opts).await.unwrap();
    assert_eq!(kernels.starts.load(Ordering::SeqCst), 1);

    registry.disconnect("python", ws1).await.unwrap();
    assert!(registry.session_id("python").await.is_some());
    assert_eq!(registry.connection_count("python").await, 1);
    assert_eq!(kernels.shutdowns.load(Ordering::SeqCst), 0);

    registry.disconnect("python", ws2).await.unwrap();
    assert_eq!(kernels.shutdowns.load(Ordering::SeqCst), 1);
    assert!(registry.session_id("python").await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_start_one_kernel() {
    let (kernels, registry) = setup();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            registry
                .connect("python", ConnectionId::new(), &KernelOptions::default())
                .await
                .unwrap()
        }));
    }

    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap());
    }

    assert_eq!(kernels.starts.load(Ordering::SeqCst), 1);
    assert!(sessions.iter().all(|s| *s == sessions[0]));
    assert_eq!(registry.connection_count("python").await, 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_racing_last_disconnect_never_double_stops() {
    let (kernels, registry) = setup();
    let opts = KernelOptions::default();

    for _ in 0..20 {
        let leaving = ConnectionId::new();
        registry.connect("python", leaving, &opts).await.unwrap();

        let joining = ConnectionId::new();
        let (left, joined) = tokio::join!(
            registry.disconnect("python", leaving),
            registry.connect("python", joining, &opts),
        );
        left.unwrap();
        joined.unwrap();

        // Whatever the interleaving, the joining connection owns a live session.
        assert!(registry.session_id("python").await.is_some());
        assert_eq!(registry.connection_count("python").await, 1);

        registry.disconnect("python", joining).await.unwrap();
        assert!(registry.session_id("python").await.is_none());
    }

    // Every kernel that started was stopped exactly once.
    assert_eq!(
        kernels.starts.load(Ordering::SeqCst),
        kernels.shutdowns.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_clear_stops_all_sessions() {
    let (kernels, registry) = setup();
    let opts = KernelOptions::default();
    registry.connect("python", ConnectionId::new(), &opts).await.unwrap();
    registry.connect("r", ConnectionId::new(), &opts).await.unwrap();

    assert_eq!(registry.kernel_specs(), vec!["python".to_string(), "r".to_string()]);
    assert_eq!(registry.clear().await, 2);
    assert_eq!(kernels.shutdowns.load(Ordering::SeqCst), 2);
    assert!(registry.kernel_specs().is_empty());
}

#[tokio::test]
async fn test_shell_kernel_output_reaches_bus() {
    let bus = EventBus::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = bus.subscribe(EventKind::KernelMessage, move |event| {
        let _ = tx.send(event.clone());
        Ok(())
    });

    let registry = SessionRegistry::new(Arc::new(ShellKernels::new(bus.clone())));
    let dir = tempfile::tempdir().unwrap();
    let conn = ConnectionId::new();
    registry
        .connect("sh", conn, &KernelOptions::in_dir(dir.path()))
        .await
        .unwrap();

    let message_id = registry.execute("sh", "printf 'a\\nb\\n'").await.unwrap();

    let mut lines = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("kernel output timed out")
            .unwrap();
        let Event::KernelMessage { parent_id, msg_type, content, .. } = event else {
            continue;
        };
        assert_eq!(parent_id, Some(message_id));
        match msg_type.as_str() {
            "stream" => lines.push(content["text"].as_str().unwrap().to_string()),
            "execute_reply" => {
                assert_eq!(content["status"], "ok");
                break;
            }
            _ => {}
        }
    }
    assert_eq!(lines, vec!["a\n".to_string(), "b\n".to_string()]);

    registry.disconnect("sh", conn).await.unwrap();
}
