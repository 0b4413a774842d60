//! Reservation record, insert payload, and status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CompetitionId, ReservationId, StudioId, Tokens, UserId};

/// Lifecycle state of a reservation.
///
/// The capacity core only performs `Pending -> Approved`; every other
/// transition belongs to the surrounding reservation workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Requested, awaiting a decision.
    Pending,
    /// Capacity granted.
    Approved,
    /// Declined by a director.
    Rejected,
    /// Voided after the fact.
    Cancelled,
}

impl ReservationStatus {
    /// Stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Only pending reservations may consume capacity through approval.
    pub fn can_approve(self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown status text read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown reservation status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ReservationStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Authoritative reservation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id.
    pub id: ReservationId,
    /// Owning competition.
    pub competition_id: CompetitionId,
    /// Requesting studio.
    pub studio_id: StudioId,
    /// Current status.
    pub status: ReservationStatus,
    /// Spaces the studio asked for.
    pub spaces_requested: Tokens,
    /// Spaces granted by approval.
    pub spaces_confirmed: Option<Tokens>,
    /// Approval time in milliseconds since epoch.
    pub approved_at_ms: Option<u64>,
    /// User that approved.
    pub approved_by: Option<UserId>,
    /// Creation time in milliseconds since epoch.
    pub created_at_ms: u64,
    /// Last update time in milliseconds since epoch.
    pub updated_at_ms: u64,
}

/// Insert payload; new reservations always start `Pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    /// Reservation id.
    pub id: ReservationId,
    /// Owning competition.
    pub competition_id: CompetitionId,
    /// Requesting studio.
    pub studio_id: StudioId,
    /// Spaces the studio asked for.
    pub spaces_requested: Tokens,
}
