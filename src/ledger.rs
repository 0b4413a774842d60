//! Append-only capacity ledger model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{CompetitionId, LedgerEntryId, ReservationId, Tokens, UserId};

/// Version number for serialized [`EntryMetadata`] payloads.
pub const METADATA_FORMAT_VERSION: u16 = 1;

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    /// Pending reservation approved; always a consumption.
    ReservationApproval,
    /// Unused confirmed spaces returned at summary submission.
    SummaryRefund,
    /// Reservation voided and its spaces returned.
    ReservationCancellation,
    /// Out-of-band administrative correction.
    ManualAdjustment,
    /// Director granted additional spaces to a reservation.
    CdAdjustmentIncrease,
    /// Director reduced the spaces of a reservation.
    CdAdjustmentDecrease,
    /// Studio added spaces to an approved reservation.
    SdSpaceIncrease,
}

impl ChangeReason {
    /// Stored column value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReservationApproval => "reservation_approval",
            Self::SummaryRefund => "summary_refund",
            Self::ReservationCancellation => "reservation_cancellation",
            Self::ManualAdjustment => "manual_adjustment",
            Self::CdAdjustmentIncrease => "cd_adjustment_increase",
            Self::CdAdjustmentDecrease => "cd_adjustment_decrease",
            Self::SdSpaceIncrease => "sd_space_increase",
        }
    }

    /// Reasons that only `reserve` may record.
    pub fn is_approval(self) -> bool {
        matches!(self, Self::ReservationApproval)
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown reason text read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown change reason: {0}")]
pub struct UnknownReason(pub String);

impl FromStr for ChangeReason {
    type Err = UnknownReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reservation_approval" => Ok(Self::ReservationApproval),
            "summary_refund" => Ok(Self::SummaryRefund),
            "reservation_cancellation" => Ok(Self::ReservationCancellation),
            "manual_adjustment" => Ok(Self::ManualAdjustment),
            "cd_adjustment_increase" => Ok(Self::CdAdjustmentIncrease),
            "cd_adjustment_decrease" => Ok(Self::CdAdjustmentDecrease),
            "sd_space_increase" => Ok(Self::SdSpaceIncrease),
            other => Err(UnknownReason(other.to_string())),
        }
    }
}

/// Counter snapshot captured alongside an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Payload format version.
    pub format_version: u16,
    /// Available tokens before the change.
    pub available_before: Tokens,
    /// Available tokens after the change.
    pub available_after: Tokens,
    /// Absolute number of tokens requested by the caller.
    pub requested: Tokens,
}

impl EntryMetadata {
    /// Builds metadata using [`METADATA_FORMAT_VERSION`].
    pub fn new(available_before: Tokens, available_after: Tokens, requested: Tokens) -> Self {
        Self {
            format_version: METADATA_FORMAT_VERSION,
            available_before,
            available_after,
            requested,
        }
    }
}

/// Immutable ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Store-assigned id, increasing in append order.
    pub id: LedgerEntryId,
    /// Competition whose pool changed.
    pub competition_id: CompetitionId,
    /// Reservation the change belongs to, if any.
    pub reservation_id: Option<ReservationId>,
    /// Signed delta: negative consumes, positive returns.
    pub change_amount: Tokens,
    /// Why the change happened.
    pub reason: ChangeReason,
    /// Acting user.
    pub created_by: UserId,
    /// Append time in milliseconds since epoch.
    pub created_at_ms: u64,
    /// Caller-supplied key that makes compensating writes retry-safe.
    pub idempotency_key: Option<String>,
    /// Counter snapshot at write time.
    pub metadata: Option<EntryMetadata>,
}

/// Entry about to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    /// Competition whose pool changed.
    pub competition_id: CompetitionId,
    /// Reservation the change belongs to, if any.
    pub reservation_id: Option<ReservationId>,
    /// Signed delta.
    pub change_amount: Tokens,
    /// Why the change happened.
    pub reason: ChangeReason,
    /// Acting user.
    pub created_by: UserId,
    /// Optional retry key.
    pub idempotency_key: Option<String>,
    /// Counter snapshot.
    pub metadata: EntryMetadata,
}

/// Audit query filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerQuery {
    /// Restrict to one reservation.
    pub reservation_id: Option<ReservationId>,
    /// Maximum rows; `None` uses the service default.
    pub limit: Option<usize>,
}

impl LedgerQuery {
    /// Filter to a single reservation.
    pub fn for_reservation(reservation_id: impl Into<ReservationId>) -> Self {
        Self {
            reservation_id: Some(reservation_id.into()),
            limit: None,
        }
    }

    /// Cap the number of rows returned.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Sum of deltas over a slice of entries.
pub fn net_change(entries: &[LedgerEntry]) -> Tokens {
    entries.iter().map(|e| e.change_amount).sum()
}
