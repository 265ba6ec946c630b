//! Concrete migrations registered with the `Migrator`.
//!
//! Ordering here is the registration order `Migrator::run` iterates in.
//! New migrations are appended to `default_registry`, never inserted
//! earlier in the list.

use rusqlite::Connection;

use crate::migrate::{inspector, Database, Migration, MigrationError};
use crate::search::store::SearchStore;
use crate::transfers::store::TransfersStore;

fn table_exists(conn: &Connection, table: &str) -> Result<bool, MigrationError> {
    Ok(inspector::list_tables(conn).map_err(|_| rusqlite::Error::ExecuteReturnedResults)?.iter().any(|t| t == table))
}

/// Creates the `transfers` table and its indexes.
/// Delegates to `TransfersStore::ensure_schema` so the store and the
/// migration can never drift out of sync on the target shape.
pub struct CreateTransfersTable;

impl Migration for CreateTransfersTable {
    fn name(&self) -> &'static str {
        "create_transfers_table"
    }
    fn database(&self) -> Database {
        Database::Transfers
    }
    fn needs_to_be_applied(&self, conn: &Connection) -> Result<bool, MigrationError> {
        Ok(!table_exists(conn, "transfers")?)
    }
    fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        TransfersStore::ensure_schema(conn).map_err(|_| MigrationError::Database(rusqlite::Error::ExecuteReturnedResults))
    }
}

/// Creates the `searches` table. Delegates to
/// `SearchStore::ensure_schema` for the same reason as `CreateTransfersTable`.
pub struct CreateSearchesTable;

impl Migration for CreateSearchesTable {
    fn name(&self) -> &'static str {
        "create_searches_table"
    }
    fn database(&self) -> Database {
        Database::Search
    }
    fn needs_to_be_applied(&self, conn: &Connection) -> Result<bool, MigrationError> {
        Ok(!table_exists(conn, "searches")?)
    }
    fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        SearchStore::ensure_schema(conn).map_err(|_| MigrationError::Database(rusqlite::Error::ExecuteReturnedResults))
    }
}

/// Translates a legacy textual `state` column (a single enum name) into the
/// numeric bitflag plus `state_description` mirror `TransfersStore` expects,
/// using a rename-copy-drop pass since SQLite has no `ALTER COLUMN ... TYPE`.
pub struct NormalizeTransferStateToBitflag;

impl NormalizeTransferStateToBitflag {
    /// Maps each single-flag legacy enum name to its bit value. Mirrors
    /// `TransferState`'s declaration order in `transfers::types`.
    const LEGACY_STATE_CASE: &'static str = "
        CASE state
            WHEN 'None' THEN 0
            WHEN 'Requested' THEN 1
            WHEN 'Queued' THEN 2
            WHEN 'Initializing' THEN 4
            WHEN 'InProgress' THEN 8
            WHEN 'Completed' THEN 16
            WHEN 'Succeeded' THEN 32
            WHEN 'Cancelled' THEN 64
            WHEN 'TimedOut' THEN 128
            WHEN 'Errored' THEN 256
            WHEN 'Rejected' THEN 512
            WHEN 'Aborted' THEN 1024
            WHEN 'Locally' THEN 2048
            WHEN 'Remotely' THEN 4096
            ELSE 0
        END";
}

impl Migration for NormalizeTransferStateToBitflag {
    fn name(&self) -> &'static str {
        "normalize_transfer_state_to_bitflag"
    }
    fn database(&self) -> Database {
        Database::Transfers
    }
    fn needs_to_be_applied(&self, conn: &Connection) -> Result<bool, MigrationError> {
        if !table_exists(conn, "transfers")? {
            return Ok(false);
        }
        let columns = inspector::columns(conn, "transfers").map_err(|_| rusqlite::Error::ExecuteReturnedResults)?;
        let legacy_state_is_text = columns
            .iter()
            .find(|c| c.name == "state")
            .is_some_and(|c| c.column_type.eq_ignore_ascii_case("text"));
        Ok(legacy_state_is_text)
    }
    fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        conn.execute_batch(&format!(
            "ALTER TABLE transfers RENAME TO transfers_legacy;
             CREATE TABLE transfers (
                id TEXT PRIMARY KEY,
                direction TEXT NOT NULL,
                username TEXT NOT NULL,
                filename TEXT NOT NULL,
                size INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                bytes_transferred INTEGER NOT NULL,
                average_speed REAL NOT NULL,
                requested_at TEXT NOT NULL,
                enqueued_at TEXT,
                started_at TEXT,
                ended_at TEXT,
                state INTEGER NOT NULL,
                state_description TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                group_id TEXT,
                removed INTEGER NOT NULL,
                exception TEXT
             );
             INSERT INTO transfers (
                id, direction, username, filename, size, start_offset, bytes_transferred,
                average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                state_description, attempts, group_id, removed, exception
             )
             SELECT
                id, direction, username, filename, size, start_offset, bytes_transferred,
                average_speed, requested_at, enqueued_at, started_at, ended_at,
                {case_expr},
                state, attempts, group_id, removed, exception
             FROM transfers_legacy;
             DROP TABLE transfers_legacy;
             CREATE INDEX IF NOT EXISTS idx_transfers_direction ON transfers(direction);
             CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state);
             CREATE INDEX IF NOT EXISTS idx_transfers_removed ON transfers(removed);
             CREATE INDEX IF NOT EXISTS idx_transfers_group_id ON transfers(group_id);
             CREATE INDEX IF NOT EXISTS idx_transfers_username_filename ON transfers(username, filename);
             CREATE INDEX IF NOT EXISTS idx_transfers_username_query ON transfers(username, direction, ended_at, started_at, state, size);",
            case_expr = Self::LEGACY_STATE_CASE,
        ))?;
        Ok(())
    }
}

/// Development-only: seeds `transfers.db` with a handful of fabricated rows
/// so a UI can be exercised against realistic-looking data. Registered only
/// behind the `seed-dev-data` feature and never part of `default_registry`'s
/// release-build shape.
#[cfg(feature = "seed-dev-data")]
pub struct SeedDevTransfers;

#[cfg(feature = "seed-dev-data")]
impl Migration for SeedDevTransfers {
    fn name(&self) -> &'static str {
        "seed_dev_transfers"
    }
    fn database(&self) -> Database {
        Database::Transfers
    }
    fn needs_to_be_applied(&self, conn: &Connection) -> Result<bool, MigrationError> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM transfers", [], |r| r.get(0))?;
        Ok(count == 0)
    }
    fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        use crate::transfers::{Direction, Transfer};

        let samples = [
            Transfer::new(Direction::Download, "devuser1", "sample-album/track01.flac", 30_000_000),
            Transfer::new(Direction::Upload, "devuser2", "shared/readme.txt", 2_048),
        ];
        for transfer in &samples {
            conn.execute(
                "INSERT INTO transfers (
                    id, direction, username, filename, size, start_offset, bytes_transferred,
                    average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                    state_description, attempts, group_id, removed, exception
                ) VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, 0.0, ?6, NULL, NULL, NULL, ?7, ?8, 0, NULL, 0, NULL)",
                rusqlite::params![
                    transfer.id.to_string(),
                    transfer.direction.as_str(),
                    transfer.username,
                    transfer.filename,
                    transfer.size as i64,
                    transfer.requested_at.to_rfc3339(),
                    transfer.state.bits() as i64,
                    transfer.state_description(),
                ],
            )?;
        }
        Ok(())
    }
}

/// The migrations this daemon ships with, in application order. The
/// `seed-dev-data` feature appends its development-only migration last so it
/// never reorders the production schema history.
pub fn default_registry() -> Vec<Box<dyn Migration>> {
    #[allow(unused_mut)]
    let mut registry: Vec<Box<dyn Migration>> = vec![
        Box::new(CreateTransfersTable),
        Box::new(CreateSearchesTable),
        Box::new(NormalizeTransferStateToBitflag),
    ];
    #[cfg(feature = "seed-dev-data")]
    registry.push(Box::new(SeedDevTransfers));
    registry
}
