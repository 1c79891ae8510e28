//! Kernel output → dependency-command progress.
//!
//! Dependency commands (package listing, installs, removals) run on a kernel
//! like any other code. [`DependencyMonitor`] watches kernel messages whose
//! parent is a tracked execute request and republishes them as
//! `DependencyUpdate`, then exactly one `DependencyComplete` or
//! `DependencyFailed`, after which the request is no longer tracked.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;
use serde_json::{Value, json};

use crate::bus::{EventBus, Subscription};
use crate::events::{Event, EventKind};
use crate::ids::{ConnectionId, MessageId};

/// Stdout kept per request for the completion payload.
const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

struct Tracked {
    connection_id: ConnectionId,
    request_id: String,
    stdout: String,
    overflowed: bool,
}

type TrackedMap = Arc<Mutex<FxHashMap<MessageId, Tracked>>>;

/// Bridges kernel messages to dependency events for tracked requests.
pub struct DependencyMonitor {
    tracked: TrackedMap,
    _subscription: Subscription,
}

impl std::fmt::Debug for DependencyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyMonitor")
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

impl DependencyMonitor {
    /// Start monitoring kernel messages on `bus`.
    pub fn new(bus: &EventBus) -> Self {
        let tracked: TrackedMap = Arc::new(Mutex::new(FxHashMap::default()));

        let map = tracked.clone();
        let publisher = bus.clone();
        let subscription = bus.subscribe(EventKind::KernelMessage, move |event| {
            // The map lock is released before republishing.
            if let Some(translated) = translate(&map, event) {
                publisher.publish(translated);
            }
            Ok(())
        });

        Self {
            tracked,
            _subscription: subscription,
        }
    }

    /// Correlate kernel output for `message_id` with `request_id` issued on
    /// `connection_id`.
    pub fn track(&self, message_id: MessageId, connection_id: ConnectionId, request_id: impl Into<String>) {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).insert(
            message_id,
            Tracked {
                connection_id,
                request_id: request_id.into(),
                stdout: String::new(),
                overflowed: false,
            },
        );
    }

    /// Stop tracking `message_id` without emitting anything.
    pub fn untrack(&self, message_id: MessageId) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&message_id)
            .is_some()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn translate(map: &TrackedMap, event: &Event) -> Option<Event> {
    let Event::KernelMessage {
        parent_id: Some(parent_id),
        msg_type,
        content,
        ..
    } = event
    else {
        return None;
    };

    let mut tracked = map.lock().unwrap_or_else(PoisonError::into_inner);
    match msg_type.as_str() {
        "stream" => {
            let entry = tracked.get_mut(parent_id)?;
            let text = content.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
            let is_stderr = content.get("name").and_then(Value::as_str) == Some("stderr");
            if is_stderr {
                Some(Event::DependencyUpdate {
                    connection_id: entry.connection_id,
                    request_id: entry.request_id.clone(),
                    stdout: None,
                    stderr: Some(text),
                })
            } else {
                if entry.stdout.len() + text.len() > MAX_PAYLOAD_BYTES {
                    entry.overflowed = true;
                } else if !entry.overflowed {
                    entry.stdout.push_str(&text);
                }
                Some(Event::DependencyUpdate {
                    connection_id: entry.connection_id,
                    request_id: entry.request_id.clone(),
                    stdout: Some(text),
                    stderr: None,
                })
            }
        }
        "execute_reply" => {
            let entry = tracked.remove(parent_id)?;
            let status = content.get("status").and_then(Value::as_str).unwrap_or("error");
            if status == "ok" {
                let payload = if entry.overflowed {
                    None
                } else {
                    serde_json::from_str::<Value>(entry.stdout.trim())
                        .ok()
                        .map(|data| json!({ "data": data }))
                };
                Some(Event::DependencyComplete {
                    connection_id: entry.connection_id,
                    request_id: entry.request_id,
                    payload,
                })
            } else {
                Some(Event::DependencyFailed {
                    connection_id: entry.connection_id,
                    request_id: entry.request_id,
                    info: failure_info(content, status),
                })
            }
        }
        _ => None,
    }
}

fn failure_info(content: &Value, status: &str) -> String {
    let ename = content.get("ename").and_then(Value::as_str);
    let evalue = content.get("evalue").and_then(Value::as_str);
    match (ename, evalue) {
        (Some(name), Some(value)) => format!("{}: {}", name, value),
        (None, Some(value)) => value.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => format!("command finished with status '{}'", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::KernelChannel;
    use crate::ids::SessionId;
    use tokio::sync::mpsc;

    fn kernel_message(parent: MessageId, msg_type: &str, content: Value) -> Event {
        Event::KernelMessage {
            kernel_spec: "python3".to_string(),
            session_id: SessionId::new(),
            channel: KernelChannel::Iopub,
            parent_id: Some(parent),
            msg_type: msg_type.to_string(),
            content,
        }
    }

    fn dependency_events(bus: &EventBus) -> (Vec<Subscription>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subs = [
            EventKind::DependencyUpdate,
            EventKind::DependencyComplete,
            EventKind::DependencyFailed,
        ]
        .into_iter()
        .map(|kind| {
            let tx = tx.clone();
            bus.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
                Ok(())
            })
        })
        .collect();
        (subs, rx)
    }

    #[test]
    fn test_stream_and_reply_become_update_then_complete() {
        let bus = EventBus::new();
        let monitor = DependencyMonitor::new(&bus);
        let (_subs, mut rx) = dependency_events(&bus);

        let (msg, conn) = (MessageId::new(), ConnectionId::new());
        monitor.track(msg, conn, "req-1");
        bus.publish(kernel_message(msg, "stream", json!({"name": "stdout", "text": "[{\"name\": \"numpy\"}]\n"})));
        bus.publish(kernel_message(msg, "execute_reply", json!({"status": "ok"})));

        match rx.try_recv().unwrap() {
            Event::DependencyUpdate {
                connection_id,
                request_id,
                stdout,
                stderr,
            } => {
                assert_eq!(connection_id, conn);
                assert_eq!(request_id, "req-1");
                assert!(stdout.is_some());
                assert!(stderr.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.try_recv().unwrap() {
            Event::DependencyComplete {
                connection_id,
                request_id,
                payload,
            } => {
                assert_eq!(connection_id, conn);
                assert_eq!(request_id, "req-1");
                assert_eq!(payload, Some(json!({"data": [{"name": "numpy"}]})));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[test]
    fn test_non_json_output_completes_without_payload() {
        let bus = EventBus::new();
        let monitor = DependencyMonitor::new(&bus);
        let (_subs, mut rx) = dependency_events(&bus);

        let (msg, conn) = (MessageId::new(), ConnectionId::new());
        monitor.track(msg, conn, "req-2");
        bus.publish(kernel_message(msg, "stream", json!({"name": "stdout", "text": "Successfully installed\n"})));
        bus.publish(kernel_message(msg, "execute_reply", json!({"status": "ok"})));

        let _update = rx.try_recv().unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::DependencyComplete {
                connection_id: conn,
                request_id: "req-2".to_string(),
                payload: None,
            }
        );
    }

    #[test]
    fn test_error_reply_becomes_failed_once() {
        let bus = EventBus::new();
        let monitor = DependencyMonitor::new(&bus);
        let (_subs, mut rx) = dependency_events(&bus);

        let (msg, conn) = (MessageId::new(), ConnectionId::new());
        monitor.track(msg, conn, "req-3");
        bus.publish(kernel_message(msg, "stream", json!({"name": "stderr", "text": "no such option\n"})));
        bus.publish(kernel_message(
            msg,
            "execute_reply",
            json!({"status": "error", "ename": "ExitStatus", "evalue": "exit status: 2"}),
        ));
        bus.publish(kernel_message(msg, "execute_reply", json!({"status": "ok"})));

        match rx.try_recv().unwrap() {
            Event::DependencyUpdate { stderr, stdout, .. } => {
                assert_eq!(stderr.as_deref(), Some("no such option\n"));
                assert!(stdout.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.try_recv().unwrap(),
            Event::DependencyFailed {
                connection_id: conn,
                request_id: "req-3".to_string(),
                info: "ExitStatus: exit status: 2".to_string(),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_untracked_messages_are_ignored() {
        let bus = EventBus::new();
        let monitor = DependencyMonitor::new(&bus);
        let (_subs, mut rx) = dependency_events(&bus);

        let msg = MessageId::new();
        monitor.track(msg, ConnectionId::new(), "req-4");
        assert!(monitor.untrack(msg));
        bus.publish(kernel_message(msg, "execute_reply", json!({"status": "ok"})));
        bus.publish(kernel_message(MessageId::new(), "stream", json!({"name": "stdout", "text": "x"})));

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropping_monitor_unsubscribes() {
        let bus = EventBus::new();
        let monitor = DependencyMonitor::new(&bus);
        assert_eq!(bus.subscriber_count(EventKind::KernelMessage), 1);
        drop(monitor);
        assert_eq!(bus.subscriber_count(EventKind::KernelMessage), 0);
    }
}
