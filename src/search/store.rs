//! Durable search records. Responses are
//! persisted as a single serialized blob; counters are top-level columns, so
//! counter-only updates (the common case, driven by the rate limiter) don't
//! have to re-serialize the whole response list on every write... except
//! that they do here, since SQLite has no partial-JSON update and a
//! coalesced write only needs to not happen too often, not be cheap.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::search::types::{Response, SearchId, SearchRecord, SearchState};

#[derive(Debug, Error)]
pub enum SearchStoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to (de)serialize responses: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub struct SearchStore {
    conn: Mutex<Connection>,
}

impl SearchStore {
    pub fn open(path: &std::path::Path) -> Result<Self, SearchStoreError> {
        let conn = Connection::open(path)?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, SearchStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn ensure_schema(conn: &Connection) -> Result<(), SearchStoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS searches (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                search_text TEXT NOT NULL,
                token INTEGER NOT NULL UNIQUE,
                state INTEGER NOT NULL,
                response_count INTEGER NOT NULL,
                file_count INTEGER NOT NULL,
                locked_file_count INTEGER NOT NULL,
                responses TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    pub async fn upsert(&self, record: &SearchRecord) -> Result<(), SearchStoreError> {
        let responses_json = serde_json::to_string(record.responses.as_deref().unwrap_or(&[]))?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO searches (
                id, started_at, ended_at, search_text, token, state,
                response_count, file_count, locked_file_count, responses
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
                ended_at = excluded.ended_at,
                state = excluded.state,
                response_count = excluded.response_count,
                file_count = excluded.file_count,
                locked_file_count = excluded.locked_file_count,
                responses = excluded.responses",
            params![
                record.id.to_string(),
                record.started_at.to_rfc3339(),
                record.ended_at.map(|d| d.to_rfc3339()),
                record.search_text,
                record.token,
                record.state.bits() as i64,
                record.response_count,
                record.file_count,
                record.locked_file_count,
                responses_json,
            ],
        )?;
        Ok(())
    }

    pub async fn get(&self, id: SearchId, include_responses: bool) -> Result<Option<SearchRecord>, SearchStoreError> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, started_at, ended_at, search_text, token, state,
                        response_count, file_count, locked_file_count, responses
                 FROM searches WHERE id = ?1",
                params![id.to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record.map(|r| finish_row(r, include_responses)))
    }

    pub async fn list(&self, include_responses: bool) -> Result<Vec<SearchRecord>, SearchStoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, ended_at, search_text, token, state,
                    response_count, file_count, locked_file_count, responses
             FROM searches ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_row(row?, include_responses));
        }
        Ok(out)
    }

    pub async fn token_in_use(&self, token: u32) -> Result<bool, SearchStoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM searches WHERE token = ?1", params![token], |r| r.get(0))?;
        Ok(count > 0)
    }

    pub async fn delete(&self, id: SearchId) -> Result<(), SearchStoreError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM searches WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

type RawRow = (SearchRecord, String);

fn finish_row((mut record, responses_json): RawRow, include_responses: bool) -> SearchRecord {
    if include_responses {
        record.responses = serde_json::from_str::<Vec<Response>>(&responses_json).ok();
    } else {
        record.responses = None;
    }
    record
}

fn parse_utc(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap())
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    let id: String = row.get(0)?;
    let started_at: String = row.get(1)?;
    let ended_at: Option<String> = row.get(2)?;
    let state_bits: i64 = row.get(5)?;
    let responses_json: String = row.get(9)?;

    let record = SearchRecord {
        id: id.parse().unwrap_or_default(),
        started_at: parse_utc(&started_at),
        ended_at: ended_at.as_deref().map(parse_utc),
        search_text: row.get(3)?,
        token: row.get(4)?,
        state: SearchState::from_bits_truncate(state_bits as u32),
        response_count: row.get(6)?,
        file_count: row.get(7)?,
        locked_file_count: row.get(8)?,
        responses: None,
    };
    Ok((record, responses_json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_get_round_trips_without_responses_by_default() {
        let store = SearchStore::open_in_memory().unwrap();
        let mut record = SearchRecord::new(SearchId::new_v4(), "flac album", 7);
        record.responses = Some(vec![Response {
            username: "peer1".into(),
            token: 7,
            has_free_upload_slot: true,
            queue_length: 0,
            upload_speed: 1000,
            files: vec![],
            locked_files: vec![],
        }]);
        store.upsert(&record).await.unwrap();

        let fetched = store.get(record.id, false).await.unwrap().unwrap();
        assert!(fetched.responses.is_none());
        assert_eq!(fetched.search_text, "flac album");

        let fetched_with_responses = store.get(record.id, true).await.unwrap().unwrap();
        assert_eq!(fetched_with_responses.responses.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn token_in_use_detects_duplicates() {
        let store = SearchStore::open_in_memory().unwrap();
        let record = SearchRecord::new(SearchId::new_v4(), "q", 42);
        store.upsert(&record).await.unwrap();
        assert!(store.token_in_use(42).await.unwrap());
        assert!(!store.token_in_use(43).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_the_row() {
        let store = SearchStore::open_in_memory().unwrap();
        let record = SearchRecord::new(SearchId::new_v4(), "q", 1);
        let id = record.id;
        store.upsert(&record).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.get(id, false).await.unwrap().is_none());
    }
}
