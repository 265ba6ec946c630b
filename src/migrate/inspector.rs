//! Schema inspector: read-only introspection of a
//! database's tables, columns, and indexes, exposed as plain functions over
//! a `rusqlite::Connection` rather than a stateful service.

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("database corrupt or in use: {0}")]
    CorruptOrInUse(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    pub column_type: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub name: String,
}

/// Lists every user table, excluding SQLite's own bookkeeping tables.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, InspectionError> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(InspectionError::from)
}

/// Column metadata for `table`, via `PRAGMA table_info`.
pub fn columns(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, InspectionError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            cid: row.get(0)?,
            name: row.get(1)?,
            column_type: row.get(2)?,
            not_null: row.get::<_, i64>(3)? != 0,
            default_value: row.get(4)?,
            primary_key: row.get::<_, i64>(5)? != 0,
        })
    })?;
    rows.collect::<Result<Vec<_>, _>>().map_err(InspectionError::from)
}

/// Index metadata for `table`, via `PRAGMA index_list`.
pub fn indexes(conn: &Connection, table: &str) -> Result<Vec<IndexInfo>, InspectionError> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({table})"))?;
    let rows = stmt.query_map([], |row| Ok(IndexInfo { name: row.get(1)? }))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(InspectionError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_tables_columns_and_indexes() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE widgets (id TEXT PRIMARY KEY, name TEXT NOT NULL);
             CREATE INDEX idx_widgets_name ON widgets(name);",
        )
        .unwrap();

        let tables = list_tables(&conn).unwrap();
        assert_eq!(tables, vec!["widgets".to_string()]);

        let cols = columns(&conn, "widgets").unwrap();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        assert!(cols[0].primary_key);
        assert!(cols[1].not_null);

        let idx = indexes(&conn, "widgets").unwrap();
        assert_eq!(idx.len(), 1);
        assert_eq!(idx[0].name, "idx_widgets_name");
    }
}
