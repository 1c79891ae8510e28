//! Kernel process management.
//!
//! The [`KernelManager`] trait is the seam to whatever actually runs kernels
//! (a Jupyter kernel gateway, a process supervisor, a test fake). Kernels
//! report their output by publishing [`Event::KernelMessage`](crate::Event)
//! on the [`EventBus`](crate::EventBus).

mod shell;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::KernelError;
use crate::ids::{MessageId, SessionId};

pub use shell::ShellKernels;

/// Options passed when starting a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelOptions {
    /// Working directory of the kernel process. Defaults to the server's.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the kernel process.
    pub env: Vec<(String, String)>,
}

impl KernelOptions {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
            env: Vec::new(),
        }
    }
}

/// External manager of kernel processes.
#[async_trait]
pub trait KernelManager: Send + Sync + 'static {
    /// Start a kernel for `kernel_spec`, registered under `session_id`.
    async fn start_kernel(
        &self,
        kernel_spec: &str,
        session_id: SessionId,
        options: &KernelOptions,
    ) -> Result<(), KernelError>;

    /// Submit `source` for execution. Output is reported asynchronously as
    /// kernel messages whose `parent_id` is `message_id`.
    async fn execute(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        source: &str,
    ) -> Result<(), KernelError>;

    /// Stop the kernel and release its resources.
    async fn shutdown_kernel(&self, session_id: SessionId) -> Result<(), KernelError>;
}
