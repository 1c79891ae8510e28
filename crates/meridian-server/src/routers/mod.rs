//! Per-channel WebSocket protocols.
//!
//! Each router pumps one connection with a [`Dispatcher`](crate::dispatcher)
//! and owns the bus subscriptions for that connection; they are dropped
//! when the connection ends.

pub mod dependencies;
pub mod notebook;
pub mod stream;

pub use notebook::NotebookManager;
