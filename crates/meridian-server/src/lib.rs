//! Meridian kernel-session routing server.
//!
//! Provides WebSocket channels that route kernel and notebook events to
//! clients.
//!
//! # Architecture
//!
//! The server consists of:
//! - **Dispatcher**: Per-connection reader/writer pump and the push variant
//! - **Protocol**: Client/server message types for each channel
//! - **Routers**: Dependency-install, notebook and kernel-stream channels
//! - **Routes**: HTTP and WebSocket handlers, permission gate

pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod routers;
pub mod routes;
pub mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use meridian_core::{EventBus, KernelManager, KernelOptions};

pub use dispatcher::{CloseReason, Dispatcher, OutboundQueue, push};
pub use error::{ServerError, ServerResult};
pub use protocol::{DependencyRequest, DependencyStatus, NotebookCommand, NotebookMessage};
pub use routers::NotebookManager;
pub use routes::{AppState, create_router};
pub use transport::TransportError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Token required on WebSocket routes. Open access when unset.
    pub token: Option<String>,
    /// Dependency channel settings.
    pub dependency: DependencyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            token: None,
            dependency: DependencyConfig::default(),
        }
    }
}

/// Where and what dependency commands may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyConfig {
    /// Kernel spec whose kernel runs dependency commands.
    pub kernel_spec: String,
    /// Working directory of that kernel. Defaults to the server's.
    pub working_dir: Option<PathBuf>,
    /// Tools a client may invoke.
    pub allowed_commands: Vec<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            kernel_spec: "python3".to_string(),
            working_dir: None,
            allowed_commands: ["pip", "rip", "uv", "conda"].map(String::from).to_vec(),
        }
    }
}

impl DependencyConfig {
    pub fn kernel_options(&self) -> KernelOptions {
        KernelOptions {
            working_dir: self.working_dir.clone(),
            env: Vec::new(),
        }
    }
}

/// Start the Meridian server.
///
/// Runs until Ctrl+C, then stops every connection and shuts down all
/// kernels.
pub async fn serve(config: ServerConfig, bus: EventBus, kernels: Arc<dyn KernelManager>) -> ServerResult<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", config.host, config.port)))?;

    let state = Arc::new(AppState::new(config, bus, kernels));
    let app = create_router(state.clone());

    tracing::info!("Starting Meridian server at http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Handle Ctrl+C for graceful shutdown
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(state.shutdown.clone().cancelled_owned())
        .await?;

    let stopped = state.registry.clear().await;
    tracing::info!("Server shutdown complete ({} kernel(s) stopped)", stopped);

    Ok(())
}
