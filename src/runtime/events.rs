//! Runtime event stream payloads.

use crate::{
    core::service::Duplicate,
    ledger::ChangeReason,
    types::{CompetitionId, ReservationId, Tokens},
};

/// Events broadcast after committed capacity operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityEvent {
    /// A pending reservation was approved.
    Reserved {
        /// Pool drawn from.
        competition_id: CompetitionId,
        /// Approved reservation.
        reservation_id: ReservationId,
        /// Tokens granted.
        spaces: Tokens,
        /// Counter after commit.
        available_after: Tokens,
    },
    /// Tokens were returned to a pool.
    Refunded {
        /// Pool returned to.
        competition_id: CompetitionId,
        /// Source reservation, if any.
        reservation_id: Option<ReservationId>,
        /// Tokens returned.
        spaces: Tokens,
        /// Recorded reason.
        reason: ChangeReason,
        /// Counter after commit.
        available_after: Tokens,
    },
    /// A manual signed adjustment was applied.
    Adjusted {
        /// Pool adjusted.
        competition_id: CompetitionId,
        /// Signed delta.
        change: Tokens,
        /// Recorded reason.
        reason: ChangeReason,
        /// Counter after commit.
        available_after: Tokens,
    },
    /// A repeated call was recognised and skipped.
    DuplicateSkipped {
        /// Pool involved.
        competition_id: CompetitionId,
        /// Which guard matched.
        duplicate: Duplicate,
    },
    /// Reconciliation found the ledger and counter disagree.
    DriftDetected {
        /// Pool with drift.
        competition_id: CompetitionId,
        /// `actual - expected`.
        discrepancy: Tokens,
    },
}
