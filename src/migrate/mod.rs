//! Migrator: idempotent, transactional, backup-guarded
//! schema evolution for the embedded relational store.
//!
//! An ordered registry keyed by a stable name, consulted against a
//! persisted "already applied" record before doing any work, with on-disk
//! SQLite schema changes guarded by a file-level backup/restore step, since
//! a failed migration must be undone at the storage layer, not just
//! reported.

pub mod history;
pub mod inspector;
pub mod migrations;

use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use thiserror::Error;

use crate::migrate::history::{HistoryError, MigrationHistory};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("migration history error: {0}")]
    History(#[from] HistoryError),
    #[error("failed to back up {database} to {backup_path}: {source}")]
    BackupFailed {
        database: String,
        backup_path: String,
        source: std::io::Error,
    },
    #[error("migration '{name}' failed and every database was restored from backup: {source}")]
    ApplyFailedAndRestored {
        name: String,
        #[source]
        source: Box<MigrationError>,
    },
    #[error("migration '{name}' failed and restoring {database} from backup also failed: {source}")]
    RestoreFailed {
        name: String,
        database: String,
        source: std::io::Error,
    },
}

/// The four logical stores the daemon persists to. `Messaging` and `Events`
/// have no migrations of their own yet, but are still backed up on every
/// run since the backup step covers every known database file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Database {
    Transfers,
    Search,
    Messaging,
    Events,
}

impl Database {
    pub const ALL: [Database; 4] = [Database::Transfers, Database::Search, Database::Messaging, Database::Events];

    pub fn file_name(&self) -> &'static str {
        match self {
            Database::Transfers => "transfers.db",
            Database::Search => "search.db",
            Database::Messaging => "messaging.db",
            Database::Events => "events.db",
        }
    }

    fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// A single schema change. `needs_to_be_applied` must be side-effect free;
/// `apply` must be idempotent so a crash between `apply` succeeding and
/// the history file being persisted is harmless on the next run.
pub trait Migration: Send + Sync {
    fn name(&self) -> &'static str;
    fn database(&self) -> Database;
    fn needs_to_be_applied(&self, conn: &Connection) -> Result<bool, MigrationError>;
    fn apply(&self, conn: &Connection) -> Result<(), MigrationError>;
}

pub struct Migrator {
    database_dir: PathBuf,
    history_path: PathBuf,
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// `migrations` is consulted in the order given; that order is the
    /// ordered name -> migration map applied on every run.
    pub fn new(database_dir: impl Into<PathBuf>, history_path: impl Into<PathBuf>, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self {
            database_dir: database_dir.into(),
            history_path: history_path.into(),
            migrations,
        }
    }

    fn db_path(&self, db: Database) -> PathBuf {
        db.path_in(&self.database_dir)
    }

    fn backup_path(&self, db: Database, timestamp: &str) -> PathBuf {
        self.database_dir.join(format!("{}.pre-migration-backup.{timestamp}.db", db.file_name()))
    }

    /// Runs every migration not yet recorded in the history file, in
    /// registration order. `force=true` ignores the history file and
    /// reapplies everything (each migration's own idempotence makes this
    /// safe). Returns `Ok(())` immediately if nothing is pending.
    pub fn run(&self, force: bool) -> Result<(), MigrationError> {
        std::fs::create_dir_all(&self.database_dir)?;

        let history = if force { MigrationHistory::default() } else { MigrationHistory::load(&self.history_path) };

        let pending: Vec<&Box<dyn Migration>> = self.migrations.iter().filter(|m| !history.contains(m.name())).collect();
        if pending.is_empty() {
            return Ok(());
        }

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%.fZ").to_string();
        let backed_up = self.backup_all(&timestamp)?;

        let mut history = history;
        for migration in &pending {
            if let Err(err) = self.apply_one(migration.as_ref()) {
                self.restore_all(&backed_up, migration.name())?;
                return Err(MigrationError::ApplyFailedAndRestored {
                    name: migration.name().to_string(),
                    source: Box::new(err),
                });
            }
            history.mark_applied(migration.name(), Utc::now());
        }

        history.save(&self.history_path)?;
        Ok(())
    }

    /// Backs up every known database file.
    /// Databases that don't exist yet (a brand-new install) are skipped —
    /// there is nothing to protect and nothing to restore.
    fn backup_all(&self, timestamp: &str) -> Result<Vec<(Database, PathBuf)>, MigrationError> {
        let mut backed_up = Vec::new();
        for db in Database::ALL {
            let source = self.db_path(db);
            if !source.exists() {
                continue;
            }
            let backup_path = self.backup_path(db, timestamp);
            std::fs::copy(&source, &backup_path).map_err(|source_err| MigrationError::BackupFailed {
                database: db.file_name().to_string(),
                backup_path: backup_path.display().to_string(),
                source: source_err,
            })?;
            backed_up.push((db, backup_path));
        }
        Ok(backed_up)
    }

    /// Restores every backed-up database byte-for-byte and logs which
    /// migration triggered the rollback. Kept as a best-effort operation per
    /// database: a restore failure for one file is surfaced, but doesn't
    /// stop the rest from being restored.
    fn restore_all(&self, backed_up: &[(Database, PathBuf)], failed_migration: &str) -> Result<(), MigrationError> {
        let mut first_restore_error = None;
        for (db, backup_path) in backed_up {
            let destination = self.db_path(*db);
            if let Err(err) = std::fs::copy(backup_path, &destination) {
                log::error!("failed to restore {} from {}: {err}", destination.display(), backup_path.display());
                if first_restore_error.is_none() {
                    first_restore_error = Some((*db, err));
                }
            }
        }
        if let Some((db, source)) = first_restore_error {
            return Err(MigrationError::RestoreFailed {
                name: failed_migration.to_string(),
                database: db.file_name().to_string(),
                source,
            });
        }
        Ok(())
    }

    /// Applies one migration inside a single transaction on its target
    /// database, so a rename-copy-drop pass either commits in full or not
    /// at all.
    fn apply_one(&self, migration: &dyn Migration) -> Result<(), MigrationError> {
        let path = self.db_path(migration.database());
        let mut conn = Connection::open(&path)?;
        let tx = conn.transaction()?;
        if migration.needs_to_be_applied(&tx)? {
            migration.apply(&tx)?;
            log::info!("applied migration '{}' to {}", migration.name(), migration.database().file_name());
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct AlwaysApply {
        name: &'static str,
        database: Database,
        sql: &'static str,
        applied: Arc<AtomicBool>,
    }

    impl Migration for AlwaysApply {
        fn name(&self) -> &'static str {
            self.name
        }
        fn database(&self) -> Database {
            self.database
        }
        fn needs_to_be_applied(&self, _conn: &Connection) -> Result<bool, MigrationError> {
            Ok(true)
        }
        fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
            conn.execute_batch(self.sql)?;
            self.applied.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingMigration {
        name: &'static str,
        database: Database,
    }

    impl Migration for FailingMigration {
        fn name(&self) -> &'static str {
            self.name
        }
        fn database(&self) -> Database {
            self.database
        }
        fn needs_to_be_applied(&self, _conn: &Connection) -> Result<bool, MigrationError> {
            Ok(true)
        }
        fn apply(&self, _conn: &Connection) -> Result<(), MigrationError> {
            Err(MigrationError::Database(rusqlite::Error::ExecuteReturnedResults))
        }
    }

    #[test]
    fn pending_migrations_run_in_order_and_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let applied = Arc::new(AtomicBool::new(false));
        let migrator = Migrator::new(
            dir.path(),
            dir.path().join("migration.history"),
            vec![Box::new(AlwaysApply {
                name: "m1",
                database: Database::Transfers,
                sql: "CREATE TABLE t (id TEXT);",
                applied: applied.clone(),
            })],
        );

        migrator.run(false).unwrap();
        assert!(applied.load(Ordering::SeqCst));

        let history = MigrationHistory::load(&dir.path().join("migration.history"));
        assert!(history.contains("m1"));
    }

    #[test]
    fn already_applied_migrations_are_skipped_on_a_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let applied = Arc::new(AtomicBool::new(false));
        let make_migrator = || {
            Migrator::new(
                dir.path(),
                dir.path().join("migration.history"),
                vec![Box::new(AlwaysApply {
                    name: "m1",
                    database: Database::Transfers,
                    sql: "CREATE TABLE IF NOT EXISTS t (id TEXT);",
                    applied: applied.clone(),
                })],
            )
        };

        make_migrator().run(false).unwrap();
        applied.store(false, Ordering::SeqCst);
        make_migrator().run(false).unwrap();

        // Second run found "m1" already in history and skipped it.
        assert!(!applied.load(Ordering::SeqCst));
    }

    /// A failing second migration rolls every database back to its
    /// pre-migration backup and leaves the history file unchanged.
    #[test]
    fn migration_recovery_restores_every_database_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let transfers_db = dir.path().join("transfers.db");
        let search_db = dir.path().join("search.db");

        {
            let conn = Connection::open(&transfers_db).unwrap();
            conn.execute_batch("CREATE TABLE original (v INTEGER); INSERT INTO original VALUES (1);").unwrap();
        }
        {
            let conn = Connection::open(&search_db).unwrap();
            conn.execute_batch("CREATE TABLE original (v INTEGER); INSERT INTO original VALUES (2);").unwrap();
        }

        let applied = Arc::new(AtomicBool::new(false));
        let migrator = Migrator::new(
            dir.path(),
            dir.path().join("migration.history"),
            vec![
                Box::new(AlwaysApply {
                    name: "m1_ok",
                    database: Database::Transfers,
                    sql: "ALTER TABLE original ADD COLUMN w INTEGER;",
                    applied: applied.clone(),
                }),
                Box::new(FailingMigration { name: "m2_fails", database: Database::Search }),
            ],
        );

        let result = migrator.run(false);
        assert!(matches!(result, Err(MigrationError::ApplyFailedAndRestored { .. })));

        // transfers.db must be restored to its pre-migration shape even
        // though its own migration succeeded, since the run as a whole failed.
        let conn = Connection::open(&transfers_db).unwrap();
        let cols = crate::migrate::inspector::columns(&conn, "original").unwrap();
        assert_eq!(cols.len(), 1, "transfers.db should have been rolled back, losing column 'w'");

        let history = MigrationHistory::load(&dir.path().join("migration.history"));
        assert!(!history.contains("m1_ok"));
        assert!(!history.contains("m2_fails"));
    }

    #[test]
    fn no_pending_migrations_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = Migrator::new(dir.path(), dir.path().join("migration.history"), vec![]);
        assert!(migrator.run(false).is_ok());
    }

    #[test]
    fn force_reapplies_even_recorded_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let applied = Arc::new(AtomicBool::new(false));
        let migration_name = "m1";
        let history_path = dir.path().join("migration.history");

        let mut history = MigrationHistory::default();
        history.mark_applied(migration_name, Utc::now());
        history.save(&history_path).unwrap();

        let migrator = Migrator::new(
            dir.path(),
            &history_path,
            vec![Box::new(AlwaysApply {
                name: migration_name,
                database: Database::Transfers,
                sql: "CREATE TABLE IF NOT EXISTS t (id TEXT);",
                applied: applied.clone(),
            })],
        );

        migrator.run(true).unwrap();
        assert!(applied.load(Ordering::SeqCst));
    }
}
