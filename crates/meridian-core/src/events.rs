//! Typed events carried by the [`EventBus`](crate::EventBus).
//!
//! Each variant is one event kind with explicit fields. Every variant carries
//! the correlation data (notebook id, cell id, request id, message id) that
//! routers filter on, so consumers pattern-match instead of probing for keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, MessageId, NotebookId, SessionId};

/// Kernel socket a raw kernel message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelChannel {
    Iopub,
    Shell,
    Stdin,
    Hb,
    Control,
}

impl KernelChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iopub => "iopub",
            Self::Shell => "shell",
            Self::Stdin => "stdin",
            Self::Hb => "hb",
            Self::Control => "control",
        }
    }
}

/// One line of kernel input history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub line_number: i64,
    pub input: String,
    pub output: Option<String>,
}

/// Discriminant of [`Event`], used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    KernelMessage,
    DependencyReceived,
    DependencyUpdate,
    DependencyComplete,
    DependencyFailed,
    CellUpdate,
    CellUpdatePatch,
    CellAdded,
    CellDeleted,
    CellExecutionReply,
    CellExecutionInput,
    CellExecutionRequest,
    ScratchUpdate,
    VarsUpdate,
    ImportError,
    PayloadPage,
    CompleteReply,
    HistoryReply,
    MetadataUpdate,
    KernelRestarted,
    KernelInterrupted,
    ClientCommand,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KernelMessage => "kernel_message",
            Self::DependencyReceived => "dependency_received",
            Self::DependencyUpdate => "dependency_update",
            Self::DependencyComplete => "dependency_complete",
            Self::DependencyFailed => "dependency_failed",
            Self::CellUpdate => "cell_update",
            Self::CellUpdatePatch => "cell_update_patch",
            Self::CellAdded => "cell_added",
            Self::CellDeleted => "cell_deleted",
            Self::CellExecutionReply => "cell_execution_reply",
            Self::CellExecutionInput => "cell_execution_input",
            Self::CellExecutionRequest => "cell_execution_request",
            Self::ScratchUpdate => "scratch_update",
            Self::VarsUpdate => "vars_update",
            Self::ImportError => "import_error",
            Self::PayloadPage => "payload_page",
            Self::CompleteReply => "complete_reply",
            Self::HistoryReply => "history_reply",
            Self::MetadataUpdate => "metadata_update",
            Self::KernelRestarted => "kernel_restarted",
            Self::KernelInterrupted => "kernel_interrupted",
            Self::ClientCommand => "client_command",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// Raw message emitted by a kernel on one of its channels.
    KernelMessage {
        kernel_spec: String,
        session_id: SessionId,
        channel: KernelChannel,
        /// Id of the execute request this message answers, if any.
        parent_id: Option<MessageId>,
        msg_type: String,
        content: Value,
    },

    /// A dependency command was accepted. Dependency events carry the
    /// connection that issued the command; request ids are only unique per
    /// connection.
    DependencyReceived {
        connection_id: ConnectionId,
        request_id: String,
    },

    /// Output produced while a dependency command runs.
    DependencyUpdate {
        connection_id: ConnectionId,
        request_id: String,
        stdout: Option<String>,
        stderr: Option<String>,
    },

    /// A dependency command finished successfully.
    DependencyComplete {
        connection_id: ConnectionId,
        request_id: String,
        payload: Option<Value>,
    },

    /// A dependency command failed.
    DependencyFailed {
        connection_id: ConnectionId,
        request_id: String,
        info: String,
    },

    CellUpdate {
        notebook_id: NotebookId,
        cells: Vec<Value>,
    },

    /// JSON patch against a single cell.
    CellUpdatePatch {
        notebook_id: NotebookId,
        cell_id: String,
        patch: Value,
    },

    CellAdded {
        notebook_id: NotebookId,
        cells: Vec<Value>,
    },

    CellDeleted {
        notebook_id: NotebookId,
        cells: Vec<Value>,
    },

    CellExecutionReply {
        notebook_id: NotebookId,
        cell_id: String,
        execution_count: Option<i64>,
        status: String,
        parent_id: MessageId,
    },

    /// The kernel asked for user input.
    CellExecutionInput {
        notebook_id: NotebookId,
        parent_id: MessageId,
        content: Value,
    },

    CellExecutionRequest {
        notebook_id: NotebookId,
        cell_id: String,
        message_id: MessageId,
    },

    ScratchUpdate {
        notebook_id: NotebookId,
        message_id: MessageId,
        output: Option<Value>,
        execution_state: Option<String>,
    },

    VarsUpdate {
        notebook_id: NotebookId,
        vars: Vec<Value>,
    },

    /// A cell failed because of missing packages.
    ImportError {
        notebook_id: NotebookId,
        cell_id: String,
        missing_dependencies: Vec<String>,
    },

    PayloadPage {
        notebook_id: NotebookId,
        message_id: MessageId,
        data: Value,
        start: Option<i64>,
        connection_id: Option<ConnectionId>,
    },

    CompleteReply {
        notebook_id: NotebookId,
        message_id: MessageId,
        matches: Vec<String>,
        cursor_start: i64,
        cursor_end: i64,
        connection_id: Option<ConnectionId>,
        command_id: Option<String>,
    },

    HistoryReply {
        notebook_id: NotebookId,
        message_id: MessageId,
        history: Vec<HistoryEntry>,
        connection_id: Option<ConnectionId>,
    },

    MetadataUpdate {
        notebook_id: NotebookId,
        metadata: Value,
    },

    KernelRestarted {
        notebook_id: NotebookId,
        cells: Vec<Value>,
        run_all_cells: bool,
    },

    KernelInterrupted { notebook_id: NotebookId },

    /// A cell asked the client to open a URL.
    ClientCommand { notebook_id: NotebookId, url: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::KernelMessage { .. } => EventKind::KernelMessage,
            Self::DependencyReceived { .. } => EventKind::DependencyReceived,
            Self::DependencyUpdate { .. } => EventKind::DependencyUpdate,
            Self::DependencyComplete { .. } => EventKind::DependencyComplete,
            Self::DependencyFailed { .. } => EventKind::DependencyFailed,
            Self::CellUpdate { .. } => EventKind::CellUpdate,
            Self::CellUpdatePatch { .. } => EventKind::CellUpdatePatch,
            Self::CellAdded { .. } => EventKind::CellAdded,
            Self::CellDeleted { .. } => EventKind::CellDeleted,
            Self::CellExecutionReply { .. } => EventKind::CellExecutionReply,
            Self::CellExecutionInput { .. } => EventKind::CellExecutionInput,
            Self::CellExecutionRequest { .. } => EventKind::CellExecutionRequest,
            Self::ScratchUpdate { .. } => EventKind::ScratchUpdate,
            Self::VarsUpdate { .. } => EventKind::VarsUpdate,
            Self::ImportError { .. } => EventKind::ImportError,
            Self::PayloadPage { .. } => EventKind::PayloadPage,
            Self::CompleteReply { .. } => EventKind::CompleteReply,
            Self::HistoryReply { .. } => EventKind::HistoryReply,
            Self::MetadataUpdate { .. } => EventKind::MetadataUpdate,
            Self::KernelRestarted { .. } => EventKind::KernelRestarted,
            Self::KernelInterrupted { .. } => EventKind::KernelInterrupted,
            Self::ClientCommand { .. } => EventKind::ClientCommand,
        }
    }

    /// Notebook this event belongs to, for notebook-scoped kinds.
    pub fn notebook_id(&self) -> Option<NotebookId> {
        match self {
            Self::KernelMessage { .. }
            | Self::DependencyReceived { .. }
            | Self::DependencyUpdate { .. }
            | Self::DependencyComplete { .. }
            | Self::DependencyFailed { .. } => None,
            Self::CellUpdate { notebook_id, .. }
            | Self::CellUpdatePatch { notebook_id, .. }
            | Self::CellAdded { notebook_id, .. }
            | Self::CellDeleted { notebook_id, .. }
            | Self::CellExecutionReply { notebook_id, .. }
            | Self::CellExecutionInput { notebook_id, .. }
            | Self::CellExecutionRequest { notebook_id, .. }
            | Self::ScratchUpdate { notebook_id, .. }
            | Self::VarsUpdate { notebook_id, .. }
            | Self::ImportError { notebook_id, .. }
            | Self::PayloadPage { notebook_id, .. }
            | Self::CompleteReply { notebook_id, .. }
            | Self::HistoryReply { notebook_id, .. }
            | Self::MetadataUpdate { notebook_id, .. }
            | Self::KernelRestarted { notebook_id, .. }
            | Self::KernelInterrupted { notebook_id }
            | Self::ClientCommand { notebook_id, .. } => Some(*notebook_id),
        }
    }

    /// Request id of dependency-command events.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::DependencyReceived { request_id, .. }
            | Self::DependencyUpdate { request_id, .. }
            | Self::DependencyComplete { request_id, .. }
            | Self::DependencyFailed { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Connection an event is addressed to. Dependency events and replies
    /// to per-connection requests (paging, completion, history) carry one;
    /// `None` means every connection on the notebook.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Self::DependencyReceived { connection_id, .. }
            | Self::DependencyUpdate { connection_id, .. }
            | Self::DependencyComplete { connection_id, .. }
            | Self::DependencyFailed { connection_id, .. } => Some(*connection_id),
            Self::PayloadPage { connection_id, .. }
            | Self::CompleteReply { connection_id, .. }
            | Self::HistoryReply { connection_id, .. } => *connection_id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let nb = NotebookId::new();
        let event = Event::KernelInterrupted { notebook_id: nb };
        assert_eq!(event.kind(), EventKind::KernelInterrupted);
        assert_eq!(event.notebook_id(), Some(nb));
        assert_eq!(event.request_id(), None);
    }

    #[test]
    fn test_dependency_events_expose_request_id() {
        let conn = ConnectionId::new();
        let event = Event::DependencyUpdate {
            connection_id: conn,
            request_id: "r-1".to_string(),
            stdout: Some("ok".to_string()),
            stderr: None,
        };
        assert_eq!(event.request_id(), Some("r-1"));
        assert_eq!(event.connection_id(), Some(conn));
        assert_eq!(event.notebook_id(), None);
        assert_eq!(event.kind().to_string(), "dependency_update");
    }

    #[test]
    fn test_kernel_channel_names() {
        let json = serde_json::to_string(&KernelChannel::Iopub).unwrap();
        assert_eq!(json, "\"iopub\"");
        assert_eq!(KernelChannel::Control.as_str(), "control");
    }

    #[test]
    fn test_connection_scoped_replies() {
        let conn = ConnectionId::new();
        let reply = Event::CompleteReply {
            notebook_id: NotebookId::new(),
            message_id: MessageId::new(),
            matches: vec!["print".to_string()],
            cursor_start: 0,
            cursor_end: 2,
            connection_id: Some(conn),
            command_id: None,
        };
        assert_eq!(reply.connection_id(), Some(conn));

        let broadcast = Event::MetadataUpdate {
            notebook_id: NotebookId::new(),
            metadata: Value::Null,
        };
        assert_eq!(broadcast.connection_id(), None);
    }
}
