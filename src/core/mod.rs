//! Capacity service and its locking primitives.

/// Transaction-scoped advisory locks.
pub mod locks;
/// Capacity service operations, requests, outcomes, and errors.
pub mod service;
