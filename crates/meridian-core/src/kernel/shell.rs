//! Local shell-backed kernels.
//!
//! Each execute request runs `sh -c <source>` in the session's working
//! directory. Output is published as Jupyter-shaped kernel messages:
//! `status` (busy/idle), `stream` (stdout/stderr lines) and `execute_reply`.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::AbortHandle;

use super::{KernelManager, KernelOptions};
use crate::bus::EventBus;
use crate::error::KernelError;
use crate::events::{Event, KernelChannel};
use crate::ids::{MessageId, SessionId};

struct ShellSession {
    kernel_spec: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    execution_count: i64,
    /// Running executions; aborting one drops (and kills) its child.
    running: Vec<AbortHandle>,
}

/// [`KernelManager`] that runs every execute request as a shell command.
pub struct ShellKernels {
    bus: EventBus,
    shell: PathBuf,
    sessions: Mutex<FxHashMap<SessionId, ShellSession>>,
}

impl std::fmt::Debug for ShellKernels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellKernels")
            .field("shell", &self.shell)
            .finish_non_exhaustive()
    }
}

impl ShellKernels {
    pub fn new(bus: EventBus) -> Self {
        Self::with_shell(bus, "sh")
    }

    /// Use a different POSIX shell binary.
    pub fn with_shell(bus: EventBus, shell: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            shell: shell.into(),
            sessions: Mutex::new(FxHashMap::default()),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl KernelManager for ShellKernels {
    async fn start_kernel(
        &self,
        kernel_spec: &str,
        session_id: SessionId,
        options: &KernelOptions,
    ) -> Result<(), KernelError> {
        if let Some(dir) = &options.working_dir {
            if !dir.is_dir() {
                return Err(KernelError::Spawn(format!(
                    "working directory does not exist: {}",
                    dir.display()
                )));
            }
        }

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(&session_id) {
            return Err(KernelError::Other(format!("session {} already running", session_id)));
        }
        sessions.insert(
            session_id,
            ShellSession {
                kernel_spec: kernel_spec.to_string(),
                working_dir: options.working_dir.clone(),
                env: options.env.clone(),
                execution_count: 0,
                running: Vec::new(),
            },
        );

        tracing::info!("Started shell kernel '{}' ({})", kernel_spec, session_id);
        Ok(())
    }

    async fn execute(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        source: &str,
    ) -> Result<(), KernelError> {
        let (mut child, publisher, execution_count) = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let session = sessions
                .get_mut(&session_id)
                .ok_or_else(|| KernelError::UnknownSession(session_id.to_string()))?;

            let mut command = Command::new(&self.shell);
            command
                .arg("-c")
                .arg(source)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(dir) = &session.working_dir {
                command.current_dir(dir);
            }
            for (key, value) in &session.env {
                command.env(key, value);
            }

            let child = command.spawn().map_err(|e| KernelError::Spawn(e.to_string()))?;
            session.execution_count += 1;
            let publisher = Publisher {
                bus: self.bus.clone(),
                kernel_spec: session.kernel_spec.clone(),
                session_id,
                parent_id: message_id,
            };
            (child, publisher, session.execution_count)
        };

        // Bus handlers run inline, so nothing is published under the session lock.
        publisher.send(KernelChannel::Iopub, "status", json!({ "execution_state": "busy" }));

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let task = tokio::spawn(async move {
            tokio::join!(
                forward_lines(stdout, "stdout", &publisher),
                forward_lines(stderr, "stderr", &publisher),
            );

            let reply = match child.wait().await {
                Ok(status) if status.success() => json!({
                    "status": "ok",
                    "execution_count": execution_count,
                }),
                Ok(status) => json!({
                    "status": "error",
                    "execution_count": execution_count,
                    "ename": "ExitStatus",
                    "evalue": status.to_string(),
                    "traceback": [],
                }),
                Err(e) => json!({
                    "status": "error",
                    "execution_count": execution_count,
                    "ename": "WaitError",
                    "evalue": e.to_string(),
                    "traceback": [],
                }),
            };
            publisher.send(KernelChannel::Shell, "execute_reply", reply);
            publisher.send(KernelChannel::Iopub, "status", json!({ "execution_state": "idle" }));
        });

        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match sessions.get_mut(&session_id) {
            Some(session) => {
                session.running.retain(|handle| !handle.is_finished());
                session.running.push(task.abort_handle());
            }
            // Shut down while the command was being spawned.
            None => task.abort(),
        }
        Ok(())
    }

    async fn shutdown_kernel(&self, session_id: SessionId) -> Result<(), KernelError> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
            .ok_or_else(|| KernelError::UnknownSession(session_id.to_string()))?;

        for handle in &session.running {
            handle.abort();
        }

        tracing::info!("Shut down shell kernel '{}' ({})", session.kernel_spec, session_id);
        Ok(())
    }
}

struct Publisher {
    bus: EventBus,
    kernel_spec: String,
    session_id: SessionId,
    parent_id: MessageId,
}

impl Publisher {
    fn send(&self, channel: KernelChannel, msg_type: &str, content: Value) {
        self.bus.publish(Event::KernelMessage {
            kernel_spec: self.kernel_spec.clone(),
            session_id: self.session_id,
            channel,
            parent_id: Some(self.parent_id),
            msg_type: msg_type.to_string(),
            content,
        });
    }
}

async fn forward_lines<R>(reader: Option<R>, name: &str, publisher: &Publisher)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => publisher.send(
                KernelChannel::Iopub,
                "stream",
                json!({ "name": name, "text": format!("{}\n", line) }),
            ),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Kernel {} read failed: {}", name, e);
                break;
            }
        }
    }
}
