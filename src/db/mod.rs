pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
    #[error("Track {id} is inconsistent: {reason}")]
    Inconsistent { id: i64, reason: String },
    #[error("Invalid features: {0}")]
    InvalidFeatures(#[from] models::FeatureError),
}

pub type Result<T> = std::result::Result<T, DbError>;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", 2)?;
        Ok(())
    }

    /// V1: tracks with their analysis features
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                storage_key     TEXT NOT NULL UNIQUE,
                original_name   TEXT NOT NULL,
                mime            TEXT,

                -- Written together, once, by analysis
                duration        REAL,
                bpm             REAL,
                energy          REAL,
                analyzed        INTEGER NOT NULL DEFAULT 0,

                created_at      TEXT NOT NULL DEFAULT (datetime('now')),

                CHECK (analyzed = 0 OR (
                    duration IS NOT NULL AND bpm IS NOT NULL AND energy IS NOT NULL
                ))
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_analyzed ON tracks(analyzed);
            ",
        )?;
        Ok(())
    }

    /// V2: soft delete (trash)
    fn migrate_v2(&self) -> Result<()> {
        let has_deleted = self
            .conn
            .prepare("SELECT name FROM pragma_table_info('tracks')")?
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .any(|name| name == "deleted");

        if !has_deleted {
            self.conn
                .execute("ALTER TABLE tracks ADD COLUMN deleted INTEGER NOT NULL DEFAULT 0", [])
                .map_err(|e| DbError::Migration(format!("adding tracks.deleted: {e}")))?;
        }

        self.conn
            .execute_batch("CREATE INDEX IF NOT EXISTS idx_tracks_deleted ON tracks(deleted);")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_set_user_version() {
        let db = Database::open_in_memory().unwrap();
        let version: i32 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("autodj.db");
        drop(Database::open(&path).unwrap());
        let db = Database::open(&path).unwrap();
        assert_eq!(db.stats().unwrap().total_tracks, 0);
    }

    #[test]
    fn test_v2_upgrades_v1_schema() {
        let db = Database::open_in_memory().unwrap();
        // Simulate a database created before soft delete existed.
        db.conn
            .execute_batch(
                "DROP TABLE tracks;
                 PRAGMA user_version = 0;",
            )
            .unwrap();
        db.migrate_v1().unwrap();
        db.conn.pragma_update(None, "user_version", 1).unwrap();
        db.migrate().unwrap();

        db.conn
            .execute(
                "INSERT INTO tracks (storage_key, original_name) VALUES ('k.mp3', 'K')",
                [],
            )
            .unwrap();
        let deleted: i64 = db
            .conn
            .query_row("SELECT deleted FROM tracks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(deleted, 0);
    }

    #[test]
    fn test_check_constraint_blocks_partial_features() {
        let db = Database::open_in_memory().unwrap();
        let result = db.conn.execute(
            "INSERT INTO tracks (storage_key, original_name, bpm, analyzed)
             VALUES ('k.mp3', 'K', 120.0, 1)",
            [],
        );
        assert!(result.is_err());
    }
}
