//! Utilities and extensions built on top of Tokio, shared by the sable
//! workers.

/// Typed broadcast bus for worker events.
pub mod events_bus;
/// `ShutdownSignal`, the cancellation channel for task groups.
pub mod shutdown;
/// Named task handles and group-join helpers.
pub mod task;

/// Default buffer size for bounded channels created in this workspace.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;

// Can save a `tokio` dependency declaration
pub use tokio;
