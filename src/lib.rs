//! Competition capacity allocation with an append-only, reconcilable ledger.
//!
//! # Examples
//!
//! Approve a reservation and audit the pool with [`core::service::CapacityService`]:
//! ```
//! use std::sync::Arc;
//!
//! use capledger::{
//!     competition::NewCompetition,
//!     core::service::{CapacityService, ReserveRequest},
//!     persist::sqlite::SqliteStore,
//!     reservation::NewReservation,
//! };
//!
//! let store = SqliteStore::open_in_memory().expect("open");
//! store.insert_competition(&NewCompetition {
//!     id: "spring-open".to_string(),
//!     total_tokens: 20,
//! }).expect("competition");
//! store.insert_reservation(&NewReservation {
//!     id: "r1".to_string(),
//!     competition_id: "spring-open".to_string(),
//!     studio_id: "studio-a".to_string(),
//!     spaces_requested: 12,
//! }).expect("reservation");
//!
//! let service = CapacityService::new(Arc::new(store));
//! let outcome = service.reserve(&ReserveRequest {
//!     competition_id: "spring-open".to_string(),
//!     reservation_id: "r1".to_string(),
//!     spaces: 12,
//!     acting_user: "director".to_string(),
//! }).expect("reserve");
//! assert!(outcome.is_applied());
//! assert_eq!(service.get_available("spring-open").expect("available"), 8);
//! assert!(service.reconcile("spring-open").expect("reconcile").is_accurate);
//! ```
//!
//! Async usage with the role-gated handle:
//! ```no_run
//! use std::sync::Arc;
//!
//! use capledger::{
//!     access::{Actor, Role},
//!     core::service::CapacityService,
//!     persist::sqlite::SqliteStore,
//!     runtime::handle::{spawn_capacity, RuntimeConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = SqliteStore::open("capacity.db").expect("open sqlite");
//! let cfg = RuntimeConfig { drift_check_interval_ms: 60_000, ..RuntimeConfig::default() };
//! let handle = spawn_capacity(CapacityService::new(Arc::new(store)), cfg);
//! let admin = Actor::new("ops", Role::SuperAdmin);
//! let report = handle.reconcile(&admin, "spring-open").await.expect("reconcile");
//! println!("discrepancy: {}", report.discrepancy);
//! handle.shutdown();
//! # }
//! ```

/// Role checks for the administrative surface.
pub mod access;
/// Bulk pre-approval routed through reserve.
pub mod bulk;
/// Competition capacity counters.
pub mod competition;
/// Capacity service and advisory locks.
pub mod core;
/// Ledger entries, reasons, and audit queries.
pub mod ledger;
/// Store errors and the SQLite store.
pub mod persist;
/// Reservation records and status state machine.
pub mod reservation;
/// Async handle and event stream.
pub mod runtime;
/// Shared identifier aliases.
pub mod types;
