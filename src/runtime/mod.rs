//! Async facade over the capacity service and its event stream.

/// Event stream types emitted by the runtime.
pub mod events;
/// Handle, gated admin entry points, and drift monitor.
pub mod handle;
