//! Transfers Store: the durable table the Transfer
//! Tracker's in-memory snapshots project into.
//!
//! A schema created eagerly on open, one `Connection` per store, held
//! behind a `tokio::sync::Mutex` rather than reopened per call: upserts here
//! must derive and persist `StateDescription` atomically with `State`,
//! which reads more naturally as a single prepared statement over a held
//! connection than as a fresh open-execute-close per write.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::transfers::types::{Direction, Transfer, TransferError, TransferId, TransferState};

pub struct TransfersStore {
    conn: Mutex<Connection>,
}

impl TransfersStore {
    pub fn open(path: &std::path::Path) -> Result<Self, TransferError> {
        let conn = Connection::open(path)?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, TransferError> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Creates the `transfers` table and its indexes if they don't already
    /// exist. Idempotent so the Migrator's own "create transfers table"
    /// migration and this defensive call never conflict.
    pub fn ensure_schema(conn: &Connection) -> Result<(), TransferError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS transfers (
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
            CREATE INDEX IF NOT EXISTS idx_transfers_direction ON transfers(direction);
            CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state);
            CREATE INDEX IF NOT EXISTS idx_transfers_removed ON transfers(removed);
            CREATE INDEX IF NOT EXISTS idx_transfers_group_id ON transfers(group_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_username_filename ON transfers(username, filename);
            CREATE INDEX IF NOT EXISTS idx_transfers_username_query ON transfers(username, direction, ended_at, started_at, state, size);",
        )?;
        Ok(())
    }

    /// Inserts or replaces a row, deriving `state_description` from `state`
    /// in the same statement so the two columns never drift apart.
    pub async fn upsert(&self, transfer: &Transfer) -> Result<(), TransferError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO transfers (
                id, direction, username, filename, size, start_offset, bytes_transferred,
                average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                state_description, attempts, group_id, removed, exception
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                direction = excluded.direction,
                username = excluded.username,
                filename = excluded.filename,
                size = excluded.size,
                start_offset = excluded.start_offset,
                bytes_transferred = excluded.bytes_transferred,
                average_speed = excluded.average_speed,
                requested_at = excluded.requested_at,
                enqueued_at = excluded.enqueued_at,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                state = excluded.state,
                state_description = excluded.state_description,
                attempts = excluded.attempts,
                group_id = excluded.group_id,
                removed = excluded.removed,
                exception = excluded.exception",
            params![
                transfer.id.to_string(),
                transfer.direction.as_str(),
                transfer.username,
                transfer.filename,
                transfer.size as i64,
                transfer.start_offset as i64,
                transfer.bytes_transferred as i64,
                transfer.average_speed,
                to_rfc3339(transfer.requested_at),
                transfer.enqueued_at.map(to_rfc3339),
                transfer.started_at.map(to_rfc3339),
                transfer.ended_at.map(to_rfc3339),
                transfer.state.bits() as i64,
                transfer.state_description(),
                transfer.attempts,
                transfer.group_id,
                transfer.removed as i64,
                transfer.exception,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, direction, username, filename, size, start_offset, bytes_transferred,
                    average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                    attempts, group_id, removed, exception
             FROM transfers WHERE id = ?1",
            params![id.to_string()],
            row_to_transfer,
        )
        .optional()
        .map_err(TransferError::from)
    }

    /// Rows for a direction, optionally excluding removed ones; newest first
    /// by `requested_at`, matching the query shape the
    /// `idx_transfers_username_query` index is built for.
    pub async fn list_by_direction(&self, direction: Direction, include_removed: bool) -> Result<Vec<Transfer>, TransferError> {
        let conn = self.conn.lock().await;
        let sql = if include_removed {
            "SELECT id, direction, username, filename, size, start_offset, bytes_transferred,
                    average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                    attempts, group_id, removed, exception
             FROM transfers WHERE direction = ?1 ORDER BY requested_at DESC"
        } else {
            "SELECT id, direction, username, filename, size, start_offset, bytes_transferred,
                    average_speed, requested_at, enqueued_at, started_at, ended_at, state,
                    attempts, group_id, removed, exception
             FROM transfers WHERE direction = ?1 AND removed = 0 ORDER BY requested_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![direction.as_str()], row_to_transfer)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(TransferError::from)
    }

    pub async fn mark_removed(&self, id: TransferId) -> Result<(), TransferError> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE transfers SET removed = 1 WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parses a stored timestamp, forcing the UTC kind on read even if the
/// stored offset was naive.
fn parse_utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap())
}

fn row_to_transfer(row: &rusqlite::Row) -> rusqlite::Result<Transfer> {
    let id: String = row.get(0)?;
    let direction: String = row.get(1)?;
    let requested_at: String = row.get(8)?;
    let enqueued_at: Option<String> = row.get(9)?;
    let started_at: Option<String> = row.get(10)?;
    let ended_at: Option<String> = row.get(11)?;
    let state_bits: i64 = row.get(12)?;

    Ok(Transfer {
        id: id.parse().unwrap_or_default(),
        direction: if direction == "Upload" { Direction::Upload } else { Direction::Download },
        username: row.get(2)?,
        filename: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        start_offset: row.get::<_, i64>(5)? as u64,
        bytes_transferred: row.get::<_, i64>(6)? as u64,
        average_speed: row.get(7)?,
        requested_at: parse_utc(&requested_at),
        enqueued_at: enqueued_at.as_deref().map(parse_utc),
        started_at: started_at.as_deref().map(parse_utc),
        ended_at: ended_at.as_deref().map(parse_utc),
        state: TransferState::from_bits_truncate(state_bits as u32),
        attempts: row.get(13)?,
        group_id: row.get(14)?,
        removed: row.get::<_, i64>(15)? != 0,
        exception: row.get(16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let store = TransfersStore::open_in_memory().unwrap();
        let transfer = Transfer::new(Direction::Download, "alice", "a.flac", 2048);
        let id = transfer.id;
        store.upsert(&transfer).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.username, "alice");
        assert_eq!(fetched.size, 2048);
        assert_eq!(fetched.state, TransferState::REQUESTED);
    }

    /// `state_description` mirrors `state` on every write.
    #[tokio::test]
    async fn state_description_is_derived_on_every_write() {
        let store = TransfersStore::open_in_memory().unwrap();
        let mut transfer = Transfer::new(Direction::Upload, "bob", "b.bin", 10);
        transfer.started_at = Some(Utc::now());
        transfer.transition(TransferState::COMPLETED).unwrap();
        let id = transfer.id;
        store.upsert(&transfer).await.unwrap();

        let conn = store.conn.lock().await;
        let description: String = conn
            .query_row("SELECT state_description FROM transfers WHERE id = ?1", params![id.to_string()], |r| r.get(0))
            .unwrap();
        assert_eq!(description, "Completed");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_conflict() {
        let store = TransfersStore::open_in_memory().unwrap();
        let mut transfer = Transfer::new(Direction::Download, "carol", "c.bin", 10);
        let id = transfer.id;
        store.upsert(&transfer).await.unwrap();

        transfer.set_bytes_transferred(5).unwrap();
        store.upsert(&transfer).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.bytes_transferred, 5);
    }

    #[tokio::test]
    async fn list_by_direction_excludes_removed_by_default() {
        let store = TransfersStore::open_in_memory().unwrap();
        let a = Transfer::new(Direction::Upload, "dave", "a.bin", 1);
        let mut b = Transfer::new(Direction::Upload, "dave", "b.bin", 1);
        b.removed = true;
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        let visible = store.list_by_direction(Direction::Upload, false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].filename, "a.bin");

        let all = store.list_by_direction(Direction::Upload, true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn mark_removed_sets_the_flag() {
        let store = TransfersStore::open_in_memory().unwrap();
        let transfer = Transfer::new(Direction::Download, "erin", "e.bin", 1);
        let id = transfer.id;
        store.upsert(&transfer).await.unwrap();
        store.mark_removed(id).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert!(fetched.removed);
    }

    #[tokio::test]
    async fn dates_round_trip_as_utc() {
        let store = TransfersStore::open_in_memory().unwrap();
        let transfer = Transfer::new(Direction::Download, "frank", "f.bin", 1);
        let id = transfer.id;
        store.upsert(&transfer).await.unwrap();

        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.requested_at.timezone(), Utc);
    }
}
