//! Shared identifier aliases and clock helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Competition identifier.
pub type CompetitionId = String;
/// Reservation identifier.
pub type ReservationId = String;
/// Studio identifier.
pub type StudioId = String;
/// Acting user identifier.
pub type UserId = String;
/// Monotonic ledger row identifier assigned by the store.
pub type LedgerEntryId = i64;
/// Token count. Signed so ledger deltas and counters share one type.
pub type Tokens = i64;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
