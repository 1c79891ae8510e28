//! Reference-counted kernel sessions.
//!
//! One kernel runs per kernel-spec name while at least one connection uses
//! it. The first `connect` starts the kernel; the `disconnect` that empties
//! the connection set shuts it down.
//!
//! Every read-modify-write of a kernel-spec entry happens under that entry's
//! async mutex, so a `connect` and a `disconnect` racing on the same name
//! cannot double-start or double-stop a kernel. An entry emptied by
//! `disconnect` is retired and removed from the map while still locked;
//! tasks that were waiting on it retry against a fresh entry.
//!
//! Kernel starts run on their own task, which keeps the entry locked until
//! the start has been recorded. A caller that gives up mid-start never
//! leaves a kernel behind: the start task shuts the kernel down again when
//! nobody is left to receive the session.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard, oneshot};

use crate::error::{KernelError, SessionError};
use crate::ids::{ConnectionId, MessageId, SessionId};
use crate::kernel::{KernelManager, KernelOptions};

#[derive(Default)]
struct Entry {
    session: Option<SessionId>,
    connections: FxHashSet<ConnectionId>,
    retired: bool,
}

type Slot = Arc<TokioMutex<Entry>>;
type Slots = Arc<Mutex<FxHashMap<String, Slot>>>;

/// Remove `slot` from `slots` if it is still the registered one.
fn remove_slot(slots: &Slots, kernel_spec: &str, slot: &Slot) {
    let mut slots = slots.lock().unwrap_or_else(PoisonError::into_inner);
    if slots.get(kernel_spec).is_some_and(|current| Arc::ptr_eq(current, slot)) {
        slots.remove(kernel_spec);
    }
}

/// Snapshot of one tracked session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub kernel_spec: String,
    pub session_id: SessionId,
    pub connections: usize,
}

/// Registry of running kernels keyed by kernel-spec name.
pub struct SessionRegistry {
    kernels: Arc<dyn KernelManager>,
    slots: Slots,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("kernel_specs", &self.kernel_specs())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new(kernels: Arc<dyn KernelManager>) -> Self {
        Self {
            kernels,
            slots: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    fn slot(&self, kernel_spec: &str) -> Slot {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kernel_spec.to_string())
            .or_default()
            .clone()
    }

    fn existing_slot(&self, kernel_spec: &str) -> Option<Slot> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kernel_spec)
            .cloned()
    }

    /// Attach `connection` to the kernel for `kernel_spec`, starting it if
    /// no connection currently uses it.
    ///
    /// Cancel-safe with respect to kernels: dropping this future mid-start
    /// never leaks a kernel. The connection may still end up attached if the
    /// start finished just as the caller went away, so callers that can be
    /// cancelled should `disconnect` unconditionally when they are done.
    pub async fn connect(
        &self,
        kernel_spec: &str,
        connection: ConnectionId,
        options: &KernelOptions,
    ) -> Result<SessionId, SessionError> {
        loop {
            let slot = self.slot(kernel_spec);
            let mut entry = slot.clone().lock_owned().await;
            if entry.retired {
                continue;
            }

            if let Some(session_id) = entry.session {
                attach(&mut entry, kernel_spec, connection);
                return Ok(session_id);
            }

            let (reply, started) = oneshot::channel();
            let start = KernelStart {
                kernels: self.kernels.clone(),
                slots: self.slots.clone(),
                slot,
                kernel_spec: kernel_spec.to_string(),
                connection,
                options: options.clone(),
            };
            tokio::spawn(start.run(entry, reply));

            return started.await.unwrap_or_else(|_| {
                Err(SessionError::StartFailed {
                    spec: kernel_spec.to_string(),
                    source: KernelError::Other("kernel start task ended unexpectedly".to_string()),
                })
            });
        }
    }

    /// Detach `connection`; shuts the kernel down when it was the last one.
    ///
    /// Detaching a connection that is not attached is a no-op. If the
    /// shutdown request fails the session is still forgotten.
    pub async fn disconnect(&self, kernel_spec: &str, connection: ConnectionId) -> Result<(), SessionError> {
        let Some(slot) = self.existing_slot(kernel_spec) else {
            return Ok(());
        };
        let mut entry = slot.lock().await;
        if entry.retired || !entry.connections.remove(&connection) {
            return Ok(());
        }
        tracing::debug!(
            "Connection {} detached from '{}' ({} left)",
            connection,
            kernel_spec,
            entry.connections.len()
        );
        if !entry.connections.is_empty() {
            return Ok(());
        }

        entry.retired = true;
        remove_slot(&self.slots, kernel_spec, &slot);
        let Some(session_id) = entry.session.take() else {
            return Ok(());
        };

        tracing::info!("Shutting down kernel '{}' ({})", kernel_spec, session_id);
        self.kernels
            .shutdown_kernel(session_id)
            .await
            .map_err(|source| SessionError::ShutdownFailed {
                spec: kernel_spec.to_string(),
                source,
            })
    }

    /// Execute `source` on the active session, returning the message id the
    /// kernel's output will be correlated with.
    pub async fn execute(&self, kernel_spec: &str, source: &str) -> Result<MessageId, SessionError> {
        let message_id = MessageId::new();
        self.execute_as(kernel_spec, message_id, source).await?;
        Ok(message_id)
    }

    /// Like [`execute`](Self::execute) with a caller-chosen message id, so
    /// correlation can be registered before the kernel can answer.
    pub async fn execute_as(
        &self,
        kernel_spec: &str,
        message_id: MessageId,
        source: &str,
    ) -> Result<(), SessionError> {
        let session_id = self
            .session_id(kernel_spec)
            .await
            .ok_or_else(|| SessionError::NoSuchSession(kernel_spec.to_string()))?;

        tracing::debug!("Executing {} on '{}' ({})", message_id, kernel_spec, session_id);
        self.kernels
            .execute(session_id, message_id, source)
            .await
            .map_err(|source| SessionError::ExecuteFailed {
                spec: kernel_spec.to_string(),
                source,
            })
    }

    /// Shut down every tracked session. Returns how many were stopped.
    pub async fn clear(&self) -> usize {
        let drained: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut stopped = 0;
        for (kernel_spec, slot) in drained {
            let mut entry = slot.lock().await;
            entry.retired = true;
            entry.connections.clear();
            let Some(session_id) = entry.session.take() else {
                continue;
            };
            match self.kernels.shutdown_kernel(session_id).await {
                Ok(()) => stopped += 1,
                Err(e) => tracing::warn!("Failed to shut down kernel '{}': {}", kernel_spec, e),
            }
        }

        if stopped > 0 {
            tracing::info!("Shut down {} kernel(s)", stopped);
        }
        stopped
    }

    pub async fn session_id(&self, kernel_spec: &str) -> Option<SessionId> {
        let slot = self.existing_slot(kernel_spec)?;
        let entry = slot.lock().await;
        if entry.retired { None } else { entry.session }
    }

    pub async fn connection_count(&self, kernel_spec: &str) -> usize {
        let Some(slot) = self.existing_slot(kernel_spec) else {
            return 0;
        };
        let entry = slot.lock().await;
        if entry.retired { 0 } else { entry.connections.len() }
    }

    /// Names with an entry in the registry, sorted.
    pub fn kernel_specs(&self) -> Vec<String> {
        let mut specs: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        specs.sort();
        specs
    }

    /// Running sessions, sorted by kernel spec.
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        let mut summaries = Vec::with_capacity(slots.len());
        for (kernel_spec, slot) in slots {
            let entry = slot.lock().await;
            if entry.retired {
                continue;
            }
            if let Some(session_id) = entry.session {
                summaries.push(SessionSummary {
                    kernel_spec,
                    session_id,
                    connections: entry.connections.len(),
                });
            }
        }
        summaries.sort_by(|a, b| a.kernel_spec.cmp(&b.kernel_spec));
        summaries
    }
}

fn attach(entry: &mut Entry, kernel_spec: &str, connection: ConnectionId) {
    entry.connections.insert(connection);
    tracing::debug!(
        "Connection {} attached to '{}' ({} total)",
        connection,
        kernel_spec,
        entry.connections.len()
    );
}

/// A kernel start detached from the `connect` call that asked for it.
struct KernelStart {
    kernels: Arc<dyn KernelManager>,
    slots: Slots,
    slot: Slot,
    kernel_spec: String,
    connection: ConnectionId,
    options: KernelOptions,
}

impl KernelStart {
    /// Start the kernel while holding `entry`, then hand the session to the
    /// waiting caller. If the caller is gone the kernel is shut down again.
    async fn run(self, mut entry: OwnedMutexGuard<Entry>, reply: oneshot::Sender<Result<SessionId, SessionError>>) {
        let session_id = SessionId::new();
        tracing::info!("Starting kernel '{}' ({})", self.kernel_spec, session_id);

        if let Err(source) = self
            .kernels
            .start_kernel(&self.kernel_spec, session_id, &self.options)
            .await
        {
            tracing::warn!("Kernel '{}' failed to start: {}", self.kernel_spec, source);
            entry.retired = true;
            remove_slot(&self.slots, &self.kernel_spec, &self.slot);
            let _ = reply.send(Err(SessionError::StartFailed {
                spec: self.kernel_spec,
                source,
            }));
            return;
        }

        entry.session = Some(session_id);
        attach(&mut entry, &self.kernel_spec, self.connection);
        if reply.send(Ok(session_id)).is_ok() {
            return;
        }

        // The session was started for this connection alone.
        tracing::info!(
            "Connect to '{}' was abandoned, shutting down kernel ({})",
            self.kernel_spec,
            session_id
        );
        entry.connections.clear();
        entry.session = None;
        entry.retired = true;
        remove_slot(&self.slots, &self.kernel_spec, &self.slot);
        if let Err(e) = self.kernels.shutdown_kernel(session_id).await {
            tracing::warn!("Failed to shut down kernel '{}': {}", self.kernel_spec, e);
        }
    }
}
