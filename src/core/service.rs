//! The capacity service: sole mutator of competition counters and the ledger.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    competition::Competition,
    core::locks::LockKey,
    ledger::{ChangeReason, EntryMetadata, LedgerEntry, LedgerQuery, NewLedgerEntry},
    persist::{
        PersistError,
        sqlite::{SqliteStore, Tx},
    },
    reservation::ReservationStatus,
    types::{CompetitionId, LedgerEntryId, ReservationId, Tokens, UserId},
};

/// Record kinds that lookups can miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// A competition row.
    Competition,
    /// A reservation row.
    Reservation,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Competition => f.write_str("competition"),
            Self::Reservation => f.write_str("reservation"),
        }
    }
}

/// Failures of capacity operations. Every mutation failure rolls back.
#[derive(Debug, Error)]
pub enum CapacityError {
    /// Bad input from the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Missing competition or reservation.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// What was looked up.
        entity: Entity,
        /// The id that missed.
        id: String,
    },
    /// Not enough tokens left. The only error meant for end users.
    #[error("insufficient capacity: requested {requested}, available {available}")]
    InsufficientCapacity {
        /// Tokens asked for.
        requested: Tokens,
        /// Tokens left at decision time.
        available: Tokens,
    },
    /// A return would lift available above total, i.e. a double refund upstream.
    #[error("refund of {requested} exceeds capacity: available {available}, total {total}")]
    RefundExceedsCapacity {
        /// Tokens to return.
        requested: Tokens,
        /// Tokens available at decision time.
        available: Tokens,
        /// Competition ceiling.
        total: Tokens,
    },
    /// Store failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl CapacityError {
    fn not_found(entity: Entity, id: &str) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the error should be shown to the end user as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Self::InsufficientCapacity { .. })
    }

    /// Friendly text for user-facing errors.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::InsufficientCapacity {
                requested,
                available,
            } => Some(format!(
                "Not enough spaces remain: {requested} requested, {available} left."
            )),
            _ => None,
        }
    }
}

/// Service tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Rows returned by [`CapacityService::get_ledger`] when no limit is given.
    pub default_ledger_limit: usize,
    /// Hard cap on requested ledger limits.
    pub max_ledger_limit: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_ledger_limit: 100,
            max_ledger_limit: 1000,
        }
    }
}

/// Approve a pending reservation by consuming `spaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    /// Pool to draw from.
    pub competition_id: CompetitionId,
    /// Reservation being approved.
    pub reservation_id: ReservationId,
    /// Tokens to grant.
    pub spaces: Tokens,
    /// Approving user.
    pub acting_user: UserId,
}

/// Return `spaces` to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    /// Pool to return to.
    pub competition_id: CompetitionId,
    /// Reservation the spaces came from, if any.
    pub reservation_id: Option<ReservationId>,
    /// Tokens to return.
    pub spaces: Tokens,
    /// Why; never `ReservationApproval`.
    pub reason: ChangeReason,
    /// Acting user.
    pub acting_user: UserId,
    /// Key of the originating event; a replay with the same key is a no-op.
    pub idempotency_key: String,
}

/// Signed administrative change to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    /// Pool to adjust.
    pub competition_id: CompetitionId,
    /// Reservation the change concerns, if any.
    pub reservation_id: Option<ReservationId>,
    /// Negative consumes, positive returns.
    pub change: Tokens,
    /// Why; never `ReservationApproval`.
    pub reason: ChangeReason,
    /// Acting user.
    pub acting_user: UserId,
    /// Key of the originating event.
    pub idempotency_key: String,
}

/// Counter movement produced by an applied operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityChange {
    /// Ledger row written.
    pub entry_id: LedgerEntryId,
    /// Available tokens before.
    pub available_before: Tokens,
    /// Available tokens after.
    pub available_after: Tokens,
}

/// Why an operation was skipped as already processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Duplicate {
    /// The reservation had already left `pending`.
    ReservationNotPending(ReservationStatus),
    /// An approval entry already exists for the reservation.
    ApprovalRecorded(LedgerEntryId),
    /// An entry with the same idempotency key already exists.
    IdempotencyKeyUsed(LedgerEntryId),
}

/// Successful result of a mutation. Rejections are errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// State changed and one ledger entry was appended.
    Applied(CapacityChange),
    /// Nothing changed; the work had been done before.
    AlreadyApplied(Duplicate),
}

impl Outcome {
    /// True when this call changed state.
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// Counter movement, when applied.
    pub fn change(&self) -> Option<&CapacityChange> {
        match self {
            Self::Applied(change) => Some(change),
            Self::AlreadyApplied(_) => None,
        }
    }
}

/// Result of comparing the ledger against live counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Competition checked.
    pub competition_id: CompetitionId,
    /// Ceiling.
    pub total: Tokens,
    /// `total - actual_available`, tokens currently granted.
    pub allocated: Tokens,
    /// Live counter.
    pub actual_available: Tokens,
    /// `total + sum(ledger deltas)`.
    pub expected_available: Tokens,
    /// `actual - expected`; zero when consistent.
    pub discrepancy: Tokens,
    /// `discrepancy == 0`.
    pub is_accurate: bool,
    /// Entries summed.
    pub ledger_entry_count: u64,
}

struct PoolChange<'a> {
    competition_id: &'a str,
    reservation_id: Option<&'a str>,
    change: Tokens,
    reason: ChangeReason,
    acting_user: &'a str,
    idempotency_key: &'a str,
}

impl PoolChange<'_> {
    /// True when `prior` records this same change, so a retry may skip it.
    fn replays(&self, prior: &LedgerEntry) -> bool {
        prior.change_amount == self.change
            && prior.reason == self.reason
            && prior.reservation_id.as_deref() == self.reservation_id
    }
}

/// Stateless service over an explicit store.
#[derive(Debug, Clone)]
pub struct CapacityService {
    store: Arc<SqliteStore>,
    config: ServiceConfig,
}

impl CapacityService {
    /// Creates a service with default settings.
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self::with_config(store, ServiceConfig::default())
    }

    /// Creates a service.
    pub fn with_config(store: Arc<SqliteStore>, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Active settings.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Approves a pending reservation, consuming `spaces` tokens.
    ///
    /// Serialized per reservation by an advisory lock and per store by the
    /// write transaction. Status, counter, and ledger change together or not
    /// at all. A reservation that is no longer pending, or that already has
    /// an approval entry, yields [`Outcome::AlreadyApplied`].
    pub fn reserve(&self, req: &ReserveRequest) -> Result<Outcome, CapacityError> {
        if req.spaces <= 0 {
            return Err(CapacityError::InvalidArgument(format!(
                "spaces must be positive, got {}",
                req.spaces
            )));
        }

        let lock = LockKey::for_id(&req.reservation_id);
        let outcome = self.store.write(Some(lock), |tx| -> Result<Outcome, CapacityError> {
            let competition = tx
                .competition(&req.competition_id)?
                .ok_or_else(|| CapacityError::not_found(Entity::Competition, &req.competition_id))?;
            let reservation = tx
                .reservation(&req.reservation_id)?
                .ok_or_else(|| CapacityError::not_found(Entity::Reservation, &req.reservation_id))?;
            if reservation.competition_id != req.competition_id {
                return Err(CapacityError::InvalidArgument(format!(
                    "reservation {} belongs to competition {}, not {}",
                    reservation.id, reservation.competition_id, req.competition_id
                )));
            }

            if !reservation.status.can_approve() {
                warn!(
                    reservation_id = %req.reservation_id,
                    status = %reservation.status,
                    "reservation already processed, status guard"
                );
                return Ok(Outcome::AlreadyApplied(Duplicate::ReservationNotPending(
                    reservation.status,
                )));
            }

            if let Some(entry_id) = tx.approval_entry(&req.reservation_id)? {
                warn!(
                    reservation_id = %req.reservation_id,
                    entry_id,
                    "reservation already processed, ledger guard"
                );
                return Ok(Outcome::AlreadyApplied(Duplicate::ApprovalRecorded(entry_id)));
            }

            let before = competition.available_tokens;

            if !tx.try_consume(&req.competition_id, req.spaces)? {
                info!(
                    competition_id = %req.competition_id,
                    reservation_id = %req.reservation_id,
                    requested = req.spaces,
                    available = before,
                    "reservation rejected, insufficient capacity"
                );
                return Err(CapacityError::InsufficientCapacity {
                    requested: req.spaces,
                    available: before,
                });
            }

            if !tx.mark_approved(&req.reservation_id, req.spaces, &req.acting_user)? {
                return Err(PersistError::Corrupt(format!(
                    "reservation {} left pending inside its own transaction",
                    req.reservation_id
                ))
                .into());
            }

            let after = before - req.spaces;
            let entry_id = tx.append_entry(&NewLedgerEntry {
                competition_id: req.competition_id.clone(),
                reservation_id: Some(req.reservation_id.clone()),
                change_amount: -req.spaces,
                reason: ChangeReason::ReservationApproval,
                created_by: req.acting_user.clone(),
                idempotency_key: None,
                metadata: EntryMetadata::new(before, after, req.spaces),
            })?;

            Ok(Outcome::Applied(CapacityChange {
                entry_id,
                available_before: before,
                available_after: after,
            }))
        })?;

        if let Outcome::Applied(change) = &outcome {
            info!(
                competition_id = %req.competition_id,
                reservation_id = %req.reservation_id,
                spaces = req.spaces,
                available_before = change.available_before,
                available_after = change.available_after,
                "capacity reserved"
            );
        }
        Ok(outcome)
    }

    /// Returns `spaces` tokens to the pool.
    ///
    /// Never lifts available above total. Idempotency keys are scoped to the
    /// competition: replaying the same change under a recorded key yields
    /// [`Outcome::AlreadyApplied`], and a different change under that key is
    /// [`CapacityError::InvalidArgument`].
    pub fn refund(&self, req: &RefundRequest) -> Result<Outcome, CapacityError> {
        if req.spaces <= 0 {
            return Err(CapacityError::InvalidArgument(format!(
                "refund spaces must be positive, got {}",
                req.spaces
            )));
        }
        self.apply_pool_change(PoolChange {
            competition_id: &req.competition_id,
            reservation_id: req.reservation_id.as_deref(),
            change: req.spaces,
            reason: req.reason,
            acting_user: &req.acting_user,
            idempotency_key: &req.idempotency_key,
        })
    }

    /// Applies a signed administrative change with the same floor and
    /// ceiling guarantees as reserve and refund.
    pub fn adjust(&self, adj: &Adjustment) -> Result<Outcome, CapacityError> {
        if adj.change == 0 {
            return Err(CapacityError::InvalidArgument(
                "adjustment must be non-zero".to_string(),
            ));
        }
        if adj.change.checked_abs().is_none() {
            return Err(CapacityError::InvalidArgument(format!(
                "adjustment {} is out of range",
                adj.change
            )));
        }
        self.apply_pool_change(PoolChange {
            competition_id: &adj.competition_id,
            reservation_id: adj.reservation_id.as_deref(),
            change: adj.change,
            reason: adj.reason,
            acting_user: &adj.acting_user,
            idempotency_key: &adj.idempotency_key,
        })
    }

    /// Live available tokens.
    pub fn get_available(&self, competition_id: &str) -> Result<Tokens, CapacityError> {
        let competition = self
            .store
            .read(|tx| tx.competition(competition_id))?
            .ok_or_else(|| CapacityError::not_found(Entity::Competition, competition_id))?;
        Ok(competition.available_tokens)
    }

    /// Audit trail, newest first. For inspection only.
    pub fn get_ledger(
        &self,
        competition_id: &str,
        query: &LedgerQuery,
    ) -> Result<Vec<LedgerEntry>, CapacityError> {
        let limit = query
            .limit
            .unwrap_or(self.config.default_ledger_limit)
            .min(self.config.max_ledger_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let entries = self.store.read(|tx| {
            tx.ledger(competition_id, query.reservation_id.as_deref(), limit)
        })?;
        Ok(entries)
    }

    /// Compares `total + sum(ledger)` with the live counter. Detection only.
    pub fn reconcile(&self, competition_id: &str) -> Result<ReconcileReport, CapacityError> {
        let report = self.store.read(|tx| -> Result<ReconcileReport, CapacityError> {
            let competition = tx
                .competition(competition_id)?
                .ok_or_else(|| CapacityError::not_found(Entity::Competition, competition_id))?;
            reconcile_in(tx, competition)
        })?;
        log_drift(&report);
        Ok(report)
    }

    /// Reconciles every competition against one read snapshot.
    pub fn reconcile_all(&self) -> Result<Vec<ReconcileReport>, CapacityError> {
        let reports = self.store.read(|tx| -> Result<Vec<ReconcileReport>, CapacityError> {
            let mut reports = Vec::new();
            for id in tx.competition_ids()? {
                let Some(competition) = tx.competition(&id)? else {
                    continue;
                };
                reports.push(reconcile_in(tx, competition)?);
            }
            Ok(reports)
        })?;
        for report in &reports {
            log_drift(report);
        }
        Ok(reports)
    }

    fn apply_pool_change(&self, change: PoolChange<'_>) -> Result<Outcome, CapacityError> {
        if change.reason.is_approval() {
            return Err(CapacityError::InvalidArgument(
                "reservation_approval entries are written by reserve only".to_string(),
            ));
        }
        if change.idempotency_key.trim().is_empty() {
            return Err(CapacityError::InvalidArgument(
                "idempotency key is required".to_string(),
            ));
        }

        let lock = change.reservation_id.map(LockKey::for_id);
        let outcome = self.store.write(lock, |tx| -> Result<Outcome, CapacityError> {
            if let Some(prior) = tx.entry_by_key(change.competition_id, change.idempotency_key)? {
                if !change.replays(&prior) {
                    return Err(CapacityError::InvalidArgument(format!(
                        "idempotency key {} already recorded entry {} with a different change",
                        change.idempotency_key, prior.id
                    )));
                }
                warn!(
                    competition_id = %change.competition_id,
                    idempotency_key = %change.idempotency_key,
                    entry_id = prior.id,
                    "capacity change already applied"
                );
                return Ok(Outcome::AlreadyApplied(Duplicate::IdempotencyKeyUsed(prior.id)));
            }

            let competition = tx
                .competition(change.competition_id)?
                .ok_or_else(|| CapacityError::not_found(Entity::Competition, change.competition_id))?;

            if let Some(reservation_id) = change.reservation_id {
                let reservation = tx
                    .reservation(reservation_id)?
                    .ok_or_else(|| CapacityError::not_found(Entity::Reservation, reservation_id))?;
                if reservation.competition_id != competition.id {
                    return Err(CapacityError::InvalidArgument(format!(
                        "reservation {} belongs to competition {}, not {}",
                        reservation.id, reservation.competition_id, competition.id
                    )));
                }
            }

            let before = competition.available_tokens;
            let magnitude = change.change.abs();
            if change.change < 0 {
                if !tx.try_consume(change.competition_id, magnitude)? {
                    return Err(CapacityError::InsufficientCapacity {
                        requested: magnitude,
                        available: before,
                    });
                }
            } else if !tx.try_release(change.competition_id, magnitude)? {
                error!(
                    competition_id = %change.competition_id,
                    reservation_id = ?change.reservation_id,
                    reason = %change.reason,
                    requested = magnitude,
                    available = before,
                    total = competition.total_tokens,
                    "refund would exceed total capacity"
                );
                return Err(CapacityError::RefundExceedsCapacity {
                    requested: magnitude,
                    available: before,
                    total: competition.total_tokens,
                });
            }

            let after = before + change.change;
            let entry_id = tx.append_entry(&NewLedgerEntry {
                competition_id: change.competition_id.to_string(),
                reservation_id: change.reservation_id.map(str::to_string),
                change_amount: change.change,
                reason: change.reason,
                created_by: change.acting_user.to_string(),
                idempotency_key: Some(change.idempotency_key.to_string()),
                metadata: EntryMetadata::new(before, after, magnitude),
            })?;

            Ok(Outcome::Applied(CapacityChange {
                entry_id,
                available_before: before,
                available_after: after,
            }))
        })?;

        if let Outcome::Applied(applied) = &outcome {
            info!(
                competition_id = %change.competition_id,
                reservation_id = ?change.reservation_id,
                reason = %change.reason,
                change = change.change,
                available_before = applied.available_before,
                available_after = applied.available_after,
                "capacity changed"
            );
        }
        Ok(outcome)
    }
}

fn reconcile_in(tx: &Tx<'_>, competition: Competition) -> Result<ReconcileReport, CapacityError> {
    if !competition.within_bounds() {
        error!(
            competition_id = %competition.id,
            total = competition.total_tokens,
            available = competition.available_tokens,
            "capacity counter outside bounds"
        );
    }
    let (net, ledger_entry_count) = tx.ledger_totals(&competition.id)?;
    let expected_available = competition.total_tokens + net;
    let discrepancy = competition.available_tokens - expected_available;
    Ok(ReconcileReport {
        allocated: competition.allocated(),
        total: competition.total_tokens,
        actual_available: competition.available_tokens,
        competition_id: competition.id,
        expected_available,
        discrepancy,
        is_accurate: discrepancy == 0,
        ledger_entry_count,
    })
}

fn log_drift(report: &ReconcileReport) {
    if !report.is_accurate {
        warn!(
            competition_id = %report.competition_id,
            expected = report.expected_available,
            actual = report.actual_available,
            discrepancy = report.discrepancy,
            "capacity drift detected"
        );
    }
}
