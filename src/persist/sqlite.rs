//! SQLite-backed competition counters, reservations, and append-only ledger.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    competition::{Competition, NewCompetition},
    core::locks::{AdvisoryLocks, LockKey},
    ledger::{ChangeReason, EntryMetadata, LedgerEntry, NewLedgerEntry},
    reservation::{NewReservation, Reservation, ReservationStatus},
    types::{CompetitionId, LedgerEntryId, Tokens, now_ms},
};

use super::{PersistError, PersistResult};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const LEDGER_COLUMNS: &str = "id, competition_id, reservation_id, change_amount, reason, \
     created_by, created_at_ms, idempotency_key, metadata";

const RESERVATION_COLUMNS: &str = "id, competition_id, studio_id, status, spaces_requested, \
     spaces_confirmed, approved_at_ms, approved_by, created_at_ms, updated_at_ms";

/// Connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a writer waits for the database write lock.
    pub busy_timeout_ms: u64,
    /// Enables WAL journaling for file-backed stores.
    pub wal: bool,
    /// Idle file connections kept for reuse.
    pub max_idle_connections: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            wal: true,
            max_idle_connections: 8,
        }
    }
}

enum Backing {
    File {
        path: PathBuf,
        idle: Mutex<Vec<Connection>>,
    },
    // A private in-memory database only exists on the connection that made it.
    Memory(Mutex<Connection>),
}

/// Relational store behind the capacity service.
///
/// Writers run inside `BEGIN IMMEDIATE` transactions, so every write unit
/// of work holds the database write lock from its first read to commit.
/// File-backed stores open one connection per concurrent unit of work and
/// may be shared by several processes; in-memory stores serialize on a
/// single connection.
pub struct SqliteStore {
    backing: Backing,
    locks: AdvisoryLocks,
    config: StoreConfig,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens or creates a file-backed store with default settings.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    /// Opens or creates a file-backed store.
    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> PersistResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = open_connection(&path, &config)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            backing: Backing::File {
                path,
                idle: Mutex::new(vec![conn]),
            },
            locks: AdvisoryLocks::new(),
            config,
        })
    }

    /// Opens a private in-memory store.
    pub fn open_in_memory() -> PersistResult<Self> {
        let config = StoreConfig::default();
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            backing: Backing::Memory(Mutex::new(conn)),
            locks: AdvisoryLocks::new(),
            config,
        })
    }

    /// Database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path),
            Backing::Memory(_) => None,
        }
    }

    /// Active connection settings.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Creates a competition with `available_tokens == total_tokens`.
    pub fn insert_competition(&self, new: &NewCompetition) -> PersistResult<Competition> {
        self.write(None, |tx| tx.insert_competition(new))
    }

    /// Creates a pending reservation.
    pub fn insert_reservation(&self, new: &NewReservation) -> PersistResult<Reservation> {
        self.write(None, |tx| tx.insert_reservation(new))
    }

    /// Loads a competition.
    pub fn competition(&self, id: &str) -> PersistResult<Option<Competition>> {
        self.read(|tx| tx.competition(id))
    }

    /// Loads a reservation.
    pub fn reservation(&self, id: &str) -> PersistResult<Option<Reservation>> {
        self.read(|tx| tx.reservation(id))
    }

    /// Ids of every competition, sorted.
    pub fn competition_ids(&self) -> PersistResult<Vec<CompetitionId>> {
        self.read(|tx| tx.competition_ids())
    }

    /// Runs `f` as one write unit of work.
    ///
    /// When `lock` is set the advisory lock is taken before the transaction
    /// begins and released only after it commits or rolls back. Returning
    /// `Err` from `f` rolls everything back.
    pub(crate) fn write<T, E>(
        &self,
        lock: Option<LockKey>,
        f: impl FnOnce(&Tx<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        let _advisory = match lock {
            Some(key) => {
                let guard = self.locks.acquire(key)?;
                debug!(key = key.0, "advisory lock acquired");
                Some(guard)
            }
            None => None,
        };

        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(PersistError::from)?;
            let out = f(&Tx { conn: &tx })?;
            tx.commit().map_err(PersistError::from)?;
            Ok(out)
        })
    }

    /// Runs `f` against one consistent read snapshot.
    pub(crate) fn read<T, E>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Deferred)
                .map_err(PersistError::from)?;
            let out = f(&Tx { conn: &tx })?;
            tx.commit().map_err(PersistError::from)?;
            Ok(out)
        })
    }

    fn with_conn<T, E>(&self, f: impl FnOnce(&mut Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<PersistError>,
    {
        match &self.backing {
            Backing::Memory(conn) => {
                let mut conn = conn.lock().map_err(|_| PersistError::Poisoned)?;
                f(&mut conn)
            }
            Backing::File { path, idle } => {
                let pooled = idle.lock().map_err(|_| PersistError::Poisoned)?.pop();
                let mut conn = match pooled {
                    Some(conn) => conn,
                    None => open_connection(path, &self.config)?,
                };
                let out = f(&mut conn);
                if let Ok(mut idle) = idle.lock() {
                    if idle.len() < self.config.max_idle_connections {
                        idle.push(conn);
                    }
                }
                out
            }
        }
    }
}

fn open_connection(path: &Path, config: &StoreConfig) -> PersistResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    if config.wal {
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

/// Typed statements available inside one unit of work.
pub(crate) struct Tx<'a> {
    conn: &'a Connection,
}

impl Tx<'_> {
    pub(crate) fn competition(&self, id: &str) -> PersistResult<Option<Competition>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, total_tokens, available_tokens FROM competitions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Competition {
                        id: row.get(0)?,
                        total_tokens: row.get(1)?,
                        available_tokens: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub(crate) fn competition_ids(&self) -> PersistResult<Vec<CompetitionId>> {
        let mut stmt = self.conn.prepare("SELECT id FROM competitions ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub(crate) fn reservation(&self, id: &str) -> PersistResult<Option<Reservation>> {
        let sql = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], reservation_from_row)
            .optional()?;
        Ok(row)
    }

    pub(crate) fn insert_competition(&self, new: &NewCompetition) -> PersistResult<Competition> {
        self.conn.execute(
            "INSERT INTO competitions(id, total_tokens, available_tokens) VALUES (?1, ?2, ?2)",
            params![new.id, new.total_tokens],
        )?;
        Ok(Competition {
            id: new.id.clone(),
            total_tokens: new.total_tokens,
            available_tokens: new.total_tokens,
        })
    }

    pub(crate) fn insert_reservation(&self, new: &NewReservation) -> PersistResult<Reservation> {
        let now = now_ms();
        self.conn.execute(
            "INSERT INTO reservations(id, competition_id, studio_id, status, spaces_requested, \
             created_at_ms, updated_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new.id,
                new.competition_id,
                new.studio_id,
                ReservationStatus::Pending.as_str(),
                new.spaces_requested,
                now as i64,
            ],
        )?;
        Ok(Reservation {
            id: new.id.clone(),
            competition_id: new.competition_id.clone(),
            studio_id: new.studio_id.clone(),
            status: ReservationStatus::Pending,
            spaces_requested: new.spaces_requested,
            spaces_confirmed: None,
            approved_at_ms: None,
            approved_by: None,
            created_at_ms: now,
            updated_at_ms: now,
        })
    }

    /// Decrements available by `spaces` only if that many remain.
    pub(crate) fn try_consume(&self, competition_id: &str, spaces: Tokens) -> PersistResult<bool> {
        let changed = self.conn.execute(
            "UPDATE competitions SET available_tokens = available_tokens - ?2 \
             WHERE id = ?1 AND available_tokens >= ?2",
            params![competition_id, spaces],
        )?;
        Ok(changed == 1)
    }

    /// Increments available by `spaces` only if the ceiling holds.
    pub(crate) fn try_release(&self, competition_id: &str, spaces: Tokens) -> PersistResult<bool> {
        let changed = self.conn.execute(
            "UPDATE competitions SET available_tokens = available_tokens + ?2 \
             WHERE id = ?1 AND available_tokens + ?2 <= total_tokens",
            params![competition_id, spaces],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn mark_approved(
        &self,
        reservation_id: &str,
        spaces: Tokens,
        approved_by: &str,
    ) -> PersistResult<bool> {
        let now = now_ms() as i64;
        let changed = self.conn.execute(
            "UPDATE reservations SET status = ?2, spaces_confirmed = ?3, approved_at_ms = ?4, \
             approved_by = ?5, updated_at_ms = ?4 WHERE id = ?1 AND status = ?6",
            params![
                reservation_id,
                ReservationStatus::Approved.as_str(),
                spaces,
                now,
                approved_by,
                ReservationStatus::Pending.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub(crate) fn approval_entry(&self, reservation_id: &str) -> PersistResult<Option<LedgerEntryId>> {
        let id = self
            .conn
            .query_row(
                "SELECT id FROM capacity_ledger WHERE reservation_id = ?1 AND reason = ?2 LIMIT 1",
                params![reservation_id, ChangeReason::ReservationApproval.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Entry previously written to `competition_id` under `key`.
    pub(crate) fn entry_by_key(
        &self,
        competition_id: &str,
        key: &str,
    ) -> PersistResult<Option<LedgerEntry>> {
        let sql = format!(
            "SELECT {LEDGER_COLUMNS} FROM capacity_ledger \
             WHERE competition_id = ?1 AND idempotency_key = ?2"
        );
        let entry = self
            .conn
            .query_row(&sql, params![competition_id, key], entry_from_row)
            .optional()?;
        Ok(entry)
    }

    pub(crate) fn append_entry(&self, entry: &NewLedgerEntry) -> PersistResult<LedgerEntryId> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        self.conn.execute(
            "INSERT INTO capacity_ledger(competition_id, reservation_id, change_amount, reason, \
             created_by, created_at_ms, idempotency_key, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.competition_id,
                entry.reservation_id,
                entry.change_amount,
                entry.reason.as_str(),
                entry.created_by,
                now_ms() as i64,
                entry.idempotency_key,
                metadata,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest-first page of entries.
    pub(crate) fn ledger(
        &self,
        competition_id: &str,
        reservation_id: Option<&str>,
        limit: usize,
    ) -> PersistResult<Vec<LedgerEntry>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match reservation_id {
            Some(reservation_id) => {
                let sql = format!(
                    "SELECT {LEDGER_COLUMNS} FROM capacity_ledger \
                     WHERE competition_id = ?1 AND reservation_id = ?2 \
                     ORDER BY id DESC LIMIT ?3"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![competition_id, reservation_id, limit], entry_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {LEDGER_COLUMNS} FROM capacity_ledger \
                     WHERE competition_id = ?1 ORDER BY id DESC LIMIT ?2"
                );
                let mut stmt = self.conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![competition_id, limit], entry_from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    /// Sum of deltas and entry count for a competition.
    pub(crate) fn ledger_totals(&self, competition_id: &str) -> PersistResult<(Tokens, u64)> {
        let (sum, count): (i64, i64) = self.conn.query_row(
            "SELECT COALESCE(SUM(change_amount), 0), COUNT(*) FROM capacity_ledger \
             WHERE competition_id = ?1",
            params![competition_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let count = u64::try_from(count)
            .map_err(|_| PersistError::Corrupt(format!("negative ledger count {count}")))?;
        Ok((sum, count))
    }
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn reservation_from_row(row: &Row<'_>) -> rusqlite::Result<Reservation> {
    let status: String = row.get(3)?;
    let status = status
        .parse::<ReservationStatus>()
        .map_err(|err| conversion_error(3, err))?;
    let approved_at_ms: Option<i64> = row.get(6)?;
    let created_at_ms: i64 = row.get(8)?;
    let updated_at_ms: i64 = row.get(9)?;
    Ok(Reservation {
        id: row.get(0)?,
        competition_id: row.get(1)?,
        studio_id: row.get(2)?,
        status,
        spaces_requested: row.get(4)?,
        spaces_confirmed: row.get(5)?,
        approved_at_ms: approved_at_ms.map(|v| v as u64),
        approved_by: row.get(7)?,
        created_at_ms: created_at_ms as u64,
        updated_at_ms: updated_at_ms as u64,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let reason: String = row.get(4)?;
    let reason = reason
        .parse::<ChangeReason>()
        .map_err(|err| conversion_error(4, err))?;
    let created_at_ms: i64 = row.get(6)?;
    let metadata: Option<String> = row.get(8)?;
    let metadata = metadata
        .map(|raw| serde_json::from_str::<EntryMetadata>(&raw))
        .transpose()
        .map_err(|err| conversion_error(8, err))?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        competition_id: row.get(1)?,
        reservation_id: row.get(2)?,
        change_amount: row.get(3)?,
        reason,
        created_by: row.get(5)?,
        created_at_ms: created_at_ms as u64,
        idempotency_key: row.get(7)?,
        metadata,
    })
}
