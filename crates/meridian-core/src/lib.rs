//! Core engine for Meridian kernel-session routing.
//!
//! This crate provides:
//! - Typed kernel and notebook events
//! - A process-wide publish/subscribe [`EventBus`]
//! - Reference-counted kernel sessions ([`SessionRegistry`])
//! - Translation of kernel output into dependency-command progress
//! - A local shell-backed [`KernelManager`] implementation

pub mod bus;
pub mod dependency;
pub mod error;
pub mod events;
pub mod ids;
pub mod kernel;
pub mod session;

pub use bus::{BusStats, EventBus, HandlerError, Subscription, SubscriptionId};
pub use dependency::DependencyMonitor;
pub use error::{Error, KernelError, Result, SessionError};
pub use events::{Event, EventKind, HistoryEntry, KernelChannel};
pub use ids::{ConnectionId, MessageId, NotebookId, SessionId};
pub use kernel::{KernelManager, KernelOptions, ShellKernels};
pub use session::{SessionRegistry, SessionSummary};
