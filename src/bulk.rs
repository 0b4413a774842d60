//! Bulk pre-approval that goes through the audited reserve path.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    core::service::{CapacityError, CapacityService, Outcome, ReserveRequest},
    reservation::NewReservation,
    types::{CompetitionId, ReservationId, StudioId, Tokens, UserId},
};

/// One studio to import with a granted allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkImportRow {
    /// Reservation id to create.
    pub reservation_id: ReservationId,
    /// Studio the reservation belongs to.
    pub studio_id: StudioId,
    /// Competition to draw from.
    pub competition_id: CompetitionId,
    /// Spaces to grant.
    pub spaces: Tokens,
}

/// Per-batch tally. Rows fail independently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkImportReport {
    /// Rows approved by this call.
    pub succeeded: usize,
    /// Rows that errored or were already processed.
    pub failed: usize,
    /// One line per failed row.
    pub errors: Vec<String>,
}

/// Creates a pending reservation per row and approves it with `reserve`.
///
/// The pending row is created before approval so a rejected row leaves a
/// visible pending reservation rather than nothing. Importing the same row
/// again reuses that reservation, so a batch can be rerun once capacity
/// frees up; rows already approved come back as duplicates.
pub fn import_preapproved(
    service: &CapacityService,
    rows: &[BulkImportRow],
    acting_user: &UserId,
) -> BulkImportReport {
    let mut report = BulkImportReport::default();

    for row in rows {
        match import_row(service, row, acting_user) {
            Ok(Outcome::Applied(_)) => report.succeeded += 1,
            Ok(Outcome::AlreadyApplied(dup)) => {
                report.failed += 1;
                report
                    .errors
                    .push(format!("{}: already processed ({dup:?})", row.reservation_id));
            }
            Err(err) => {
                report.failed += 1;
                let msg = err.user_message().unwrap_or_else(|| err.to_string());
                report.errors.push(format!("{}: {msg}", row.reservation_id));
            }
        }
    }

    if report.failed > 0 {
        warn!(
            succeeded = report.succeeded,
            failed = report.failed,
            "bulk import finished with failures"
        );
    } else {
        info!(succeeded = report.succeeded, "bulk import finished");
    }
    report
}

fn import_row(
    service: &CapacityService,
    row: &BulkImportRow,
    acting_user: &UserId,
) -> Result<Outcome, CapacityError> {
    if row.spaces <= 0 {
        return Err(CapacityError::InvalidArgument(format!(
            "spaces must be positive, got {}",
            row.spaces
        )));
    }
    let store = service.store();
    if store.reservation(&row.reservation_id)?.is_none() {
        store.insert_reservation(&NewReservation {
            id: row.reservation_id.clone(),
            competition_id: row.competition_id.clone(),
            studio_id: row.studio_id.clone(),
            spaces_requested: row.spaces,
        })?;
    }
    service.reserve(&ReserveRequest {
        competition_id: row.competition_id.clone(),
        reservation_id: row.reservation_id.clone(),
        spaces: row.spaces,
        acting_user: acting_user.clone(),
    })
}
