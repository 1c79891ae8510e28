//! WebSocket protocol messages for Meridian server.
//!
//! Defines the message types exchanged on the dependency and notebook
//! channels.

use meridian_core::{Event, HistoryEntry, MessageId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Dependency command sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRequest {
    /// Package tool to run, e.g. `pip`.
    pub command: String,
    /// Tool subcommand, e.g. `install`.
    pub subcommand: String,
    /// Remaining arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Client-chosen correlation id echoed on every status message.
    pub request_id: String,
}

impl DependencyRequest {
    /// Shell command line for this request. The subcommand and every
    /// argument are single-quoted.
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for part in std::iter::once(&self.subcommand).chain(&self.args) {
            line.push(' ');
            line.push_str(&shell_quote(part));
        }
        line
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Progress of a dependency command, sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DependencyStatus {
    /// The command was accepted.
    Received { request_id: String },

    /// Output from the running command.
    Update {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },

    /// The command finished.
    Complete {
        request_id: String,
        /// Structured result, e.g. the package list for `list`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },

    /// The command was rejected or failed.
    Failed { request_id: String, info: String },
}

impl DependencyStatus {
    /// Request id used when a command is too malformed to carry one.
    pub const UNKNOWN_REQUEST: &'static str = "unknown";

    pub fn request_id(&self) -> &str {
        match self {
            Self::Received { request_id }
            | Self::Update { request_id, .. }
            | Self::Complete { request_id, .. }
            | Self::Failed { request_id, .. } => request_id,
        }
    }

    /// Whether no further status follows for this request.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Failed { .. })
    }

    /// Status message for a dependency event.
    pub fn from_event(event: &Event) -> Option<Self> {
        let status = match event {
            Event::DependencyReceived { request_id, .. } => Self::Received {
                request_id: request_id.clone(),
            },
            Event::DependencyUpdate {
                request_id,
                stdout,
                stderr,
                ..
            } => Self::Update {
                request_id: request_id.clone(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
            },
            Event::DependencyComplete { request_id, payload, .. } => Self::Complete {
                request_id: request_id.clone(),
                payload: payload.clone(),
            },
            Event::DependencyFailed { request_id, info, .. } => Self::Failed {
                request_id: request_id.clone(),
                info: info.clone(),
            },
            _ => return None,
        };
        Some(status)
    }
}

/// Command sent by the client on the notebook channel.
///
/// Every field is optional on the wire so that a malformed command can
/// still be answered with its `command_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotebookCommand {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub command_id: Option<String>,
}

/// Body of the `complete` notebook command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    /// Source to complete.
    pub code: String,
    /// Cursor offset into `code`.
    pub cursor_position: usize,
}

/// Messages sent by the server on the notebook channel.
///
/// Serialized as a single-key object whose key names the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotebookMessage {
    /// Full state of the changed cells.
    CellUpdate(Vec<Value>),

    /// JSON patch against one cell.
    CellUpdatePatch { cell_id: String, patch: Value },

    #[serde(rename = "cell_add")]
    CellAdded(Vec<Value>),

    #[serde(rename = "cell_delete")]
    CellDeleted(Vec<Value>),

    CellExecutionReply {
        cell_id: String,
        execution_count: Option<i64>,
        status: String,
        parent_id: MessageId,
    },

    /// The kernel is waiting for input.
    CellExecutionInput { content: Value, parent_id: MessageId },

    CellExecutionRequest { cell_id: String, message_id: MessageId },

    ScratchUpdate {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_state: Option<String>,
    },

    /// Kernel variables.
    Vars(Vec<Value>),

    ImportError {
        cell_id: String,
        missing_dependencies: Vec<String>,
    },

    /// Pager output (e.g. `help()`).
    PayloadPage {
        data: Value,
        start: Option<i64>,
        message_id: MessageId,
    },

    CompleteReply {
        matches: Vec<String>,
        cursor_start: i64,
        cursor_end: i64,
        message_id: MessageId,
        command_id: Option<String>,
    },

    HistoryReply {
        history: Vec<HistoryEntry>,
        message_id: MessageId,
    },

    Metadata(Value),

    KernelRestarted { run_all_cells: bool, cells: Vec<Value> },

    KernelInterrupted { interrupted: bool },

    /// Ask the client to open a URL.
    ClientCommandUrl { command: String },

    /// A client command could not be processed.
    Error {
        message: String,
        command_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl NotebookMessage {
    /// Wire key of this message.
    pub fn key(&self) -> &'static str {
        match self {
            Self::CellUpdate(_) => "cell_update",
            Self::CellUpdatePatch { .. } => "cell_update_patch",
            Self::CellAdded(_) => "cell_add",
            Self::CellDeleted(_) => "cell_delete",
            Self::CellExecutionReply { .. } => "cell_execution_reply",
            Self::CellExecutionInput { .. } => "cell_execution_input",
            Self::CellExecutionRequest { .. } => "cell_execution_request",
            Self::ScratchUpdate { .. } => "scratch_update",
            Self::Vars(_) => "vars",
            Self::ImportError { .. } => "import_error",
            Self::PayloadPage { .. } => "payload_page",
            Self::CompleteReply { .. } => "complete_reply",
            Self::HistoryReply { .. } => "history_reply",
            Self::Metadata(_) => "metadata",
            Self::KernelRestarted { .. } => "kernel_restarted",
            Self::KernelInterrupted { .. } => "kernel_interrupted",
            Self::ClientCommandUrl { .. } => "client_command_url",
            Self::Error { .. } => "error",
        }
    }

    /// Outbound message for a notebook event. Routing (notebook and
    /// connection filtering) is the caller's job.
    pub fn from_event(event: &Event) -> Option<Self> {
        let message = match event {
            Event::CellUpdate { cells, .. } => Self::CellUpdate(cells.clone()),
            Event::CellUpdatePatch { cell_id, patch, .. } => Self::CellUpdatePatch {
                cell_id: cell_id.clone(),
                patch: patch.clone(),
            },
            Event::CellAdded { cells, .. } => Self::CellAdded(cells.clone()),
            Event::CellDeleted { cells, .. } => Self::CellDeleted(cells.clone()),
            Event::CellExecutionReply {
                cell_id,
                execution_count,
                status,
                parent_id,
                ..
            } => Self::CellExecutionReply {
                cell_id: cell_id.clone(),
                execution_count: *execution_count,
                status: status.clone(),
                parent_id: *parent_id,
            },
            Event::CellExecutionInput {
                parent_id, content, ..
            } => Self::CellExecutionInput {
                content: content.clone(),
                parent_id: *parent_id,
            },
            Event::CellExecutionRequest {
                cell_id, message_id, ..
            } => Self::CellExecutionRequest {
                cell_id: cell_id.clone(),
                message_id: *message_id,
            },
            Event::ScratchUpdate {
                message_id,
                output,
                execution_state,
                ..
            } => Self::ScratchUpdate {
                message_id: *message_id,
                output: output.clone(),
                execution_state: execution_state.clone(),
            },
            Event::VarsUpdate { vars, .. } => Self::Vars(vars.clone()),
            Event::ImportError {
                cell_id,
                missing_dependencies,
                ..
            } => Self::ImportError {
                cell_id: cell_id.clone(),
                missing_dependencies: missing_dependencies.clone(),
            },
            Event::PayloadPage {
                message_id,
                data,
                start,
                ..
            } => Self::PayloadPage {
                data: data.clone(),
                start: *start,
                message_id: *message_id,
            },
            Event::CompleteReply {
                message_id,
                matches,
                cursor_start,
                cursor_end,
                command_id,
                ..
            } => Self::CompleteReply {
                matches: matches.clone(),
                cursor_start: *cursor_start,
                cursor_end: *cursor_end,
                message_id: *message_id,
                command_id: command_id.clone(),
            },
            Event::HistoryReply {
                message_id, history, ..
            } => Self::HistoryReply {
                history: history.clone(),
                message_id: *message_id,
            },
            Event::MetadataUpdate { metadata, .. } => Self::Metadata(metadata.clone()),
            Event::KernelRestarted {
                cells, run_all_cells, ..
            } => Self::KernelRestarted {
                run_all_cells: *run_all_cells,
                cells: cells.clone(),
            },
            Event::KernelInterrupted { .. } => Self::KernelInterrupted { interrupted: true },
            Event::ClientCommand { url, .. } => Self::ClientCommandUrl { command: url.clone() },
            Event::KernelMessage { .. }
            | Event::DependencyReceived { .. }
            | Event::DependencyUpdate { .. }
            | Event::DependencyComplete { .. }
            | Event::DependencyFailed { .. } => return None,
        };
        Some(message)
    }
}
