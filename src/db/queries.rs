use super::models::{Features, LibraryStats, NewTrack, Track};
use super::{Database, DbError, Result};
use rusqlite::{params, params_from_iter, Row};

const TRACK_COLUMNS: &str =
    "id, storage_key, original_name, mime, duration, bpm, energy, analyzed, deleted";

/// Raw columns of a `tracks` row, before the analyzed invariant is checked.
struct TrackRow {
    id: i64,
    storage_key: String,
    original_name: String,
    mime: Option<String>,
    duration: Option<f64>,
    bpm: Option<f64>,
    energy: Option<f64>,
    analyzed: bool,
    deleted: bool,
}

impl TrackRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            storage_key: row.get(1)?,
            original_name: row.get(2)?,
            mime: row.get(3)?,
            duration: row.get(4)?,
            bpm: row.get(5)?,
            energy: row.get(6)?,
            analyzed: row.get(7)?,
            deleted: row.get(8)?,
        })
    }

    /// Values are carried as stored; range checks belong to the consumer.
    fn into_track(self) -> Result<Track> {
        let features = if self.analyzed {
            match (self.duration, self.bpm, self.energy) {
                (Some(duration), Some(bpm), Some(energy)) => Some(Features { duration, bpm, energy }),
                _ => {
                    return Err(DbError::Inconsistent {
                        id: self.id,
                        reason: "marked analyzed with a missing feature column".into(),
                    });
                }
            }
        } else {
            None
        };

        Ok(Track {
            id: self.id,
            storage_key: self.storage_key,
            original_name: self.original_name,
            mime: self.mime,
            deleted: self.deleted,
            features,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

impl Database {
    /// Insert an unanalyzed track. Returns the track id.
    pub fn insert_track(&self, t: &NewTrack) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tracks (storage_key, original_name, mime, deleted)
             VALUES (?1, ?2, ?3, 0)",
            params![t.storage_key, t.original_name, t.mime],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_track(&self, id: i64) -> Result<Option<Track>> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1");
        let row = match self.conn.query_row(&sql, params![id], TrackRow::from_row) {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        row.into_track().map(Some)
    }

    fn query_tracks(&self, sql: &str) -> Result<Vec<Track>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([], TrackRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(TrackRow::into_track).collect()
    }

    /// All tracks, newest first.
    pub fn list_tracks(&self, include_deleted: bool) -> Result<Vec<Track>> {
        let filter = if include_deleted { "" } else { "WHERE deleted = 0" };
        self.query_tracks(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks {filter} ORDER BY id DESC"
        ))
    }

    /// The candidate pool: analyzed tracks, excluding trashed ones unless asked.
    pub fn get_candidates(&self, include_deleted: bool) -> Result<Vec<Track>> {
        let filter = if include_deleted { "" } else { "AND deleted = 0" };
        self.query_tracks(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE analyzed = 1 {filter} ORDER BY id"
        ))
    }

    /// Tracks still waiting for analysis.
    pub fn get_unanalyzed_tracks(&self, include_deleted: bool) -> Result<Vec<Track>> {
        let filter = if include_deleted { "" } else { "AND deleted = 0" };
        self.query_tracks(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE analyzed = 0 {filter} ORDER BY id"
        ))
    }

    /// Write all three features and flip `analyzed` in one statement.
    ///
    /// Returns `false` when the track does not exist or was already analyzed;
    /// stored features are never overwritten.
    pub fn store_features(&self, track_id: i64, f: &Features) -> Result<bool> {
        f.validate()?;
        let changed = self.conn.execute(
            "UPDATE tracks SET duration = ?1, bpm = ?2, energy = ?3, analyzed = 1
             WHERE id = ?4 AND analyzed = 0",
            params![f.duration, f.bpm, f.energy, track_id],
        )?;
        Ok(changed > 0)
    }

    /// Move tracks to (or back out of) the trash. Returns rows changed.
    pub fn set_deleted(&self, ids: &[i64], deleted: bool) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE tracks SET deleted = {} WHERE id IN ({})",
            i32::from(deleted),
            placeholders(ids.len())
        );
        Ok(self.conn.execute(&sql, params_from_iter(ids.iter()))?)
    }

    /// Permanently remove tracks. Returns the removed rows so their blobs can go too.
    pub fn purge(&self, ids: &[i64]) -> Result<Vec<Track>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let tx = self.conn.unchecked_transaction()?;
        let marks = placeholders(ids.len());

        let removed = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {TRACK_COLUMNS} FROM tracks WHERE id IN ({marks}) ORDER BY id"
            ))?;
            stmt.query_map(params_from_iter(ids.iter()), TrackRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        tx.execute(
            &format!("DELETE FROM tracks WHERE id IN ({marks})"),
            params_from_iter(ids.iter()),
        )?;
        tx.commit()?;

        removed.into_iter().map(TrackRow::into_track).collect()
    }

    /// Permanently remove everything in the trash.
    pub fn purge_trash(&self) -> Result<Vec<Track>> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare("SELECT id FROM tracks WHERE deleted = 1")?;
            stmt.query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };
        self.purge(&ids)
    }

    /// Library statistics.
    pub fn stats(&self) -> Result<LibraryStats> {
        let stats = self.conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(analyzed), 0),
                COALESCE(SUM(deleted), 0),
                AVG(CASE WHEN analyzed = 1 THEN bpm END),
                AVG(CASE WHEN analyzed = 1 THEN energy END),
                COALESCE(SUM(CASE WHEN analyzed = 1 THEN duration END), 0.0)
             FROM tracks",
            [],
            |row| {
                Ok(LibraryStats {
                    total_tracks: row.get(0)?,
                    analyzed_tracks: row.get(1)?,
                    deleted_tracks: row.get(2)?,
                    mean_bpm: row.get(3)?,
                    mean_energy: row.get(4)?,
                    total_duration_secs: row.get(5)?,
                })
            },
        )?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FeatureError;

    fn new_track(key: &str) -> NewTrack {
        NewTrack {
            storage_key: key.to_string(),
            original_name: format!("{key} (original)"),
            mime: Some("audio/mpeg".to_string()),
        }
    }

    fn features() -> Features {
        Features::new(200.0, 120.0, 0.5).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&new_track("a.mp3")).unwrap();
        assert!(id > 0);

        let track = db.get_track(id).unwrap().unwrap();
        assert_eq!(track.storage_key, "a.mp3");
        assert_eq!(track.mime.as_deref(), Some("audio/mpeg"));
        assert!(!track.is_analyzed());
        assert!(!track.deleted);

        assert!(db.get_track(id + 100).unwrap().is_none());
    }

    #[test]
    fn test_store_features_is_write_once() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&new_track("a.mp3")).unwrap();

        assert!(db.store_features(id, &features()).unwrap());
        let second = Features::new(10.0, 90.0, 0.1).unwrap();
        assert!(!db.store_features(id, &second).unwrap());

        let track = db.get_track(id).unwrap().unwrap();
        assert_eq!(track.features, Some(features()));
    }

    #[test]
    fn test_store_features_rejects_invalid_without_writing() {
        let db = Database::open_in_memory().unwrap();
        let id = db.insert_track(&new_track("a.mp3")).unwrap();

        let bad = Features { duration: 10.0, bpm: -5.0, energy: 0.5 };
        let err = db.store_features(id, &bad).unwrap_err();
        assert!(matches!(err, DbError::InvalidFeatures(FeatureError::Bpm(_))));

        let track = db.get_track(id).unwrap().unwrap();
        assert!(!track.is_analyzed());
        let raw: Option<f64> = db
            .conn
            .query_row("SELECT duration FROM tracks WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert!(raw.is_none());
    }

    #[test]
    fn test_store_features_missing_track() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.store_features(42, &features()).unwrap());
    }

    #[test]
    fn test_candidates_and_unanalyzed_partition() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_track(&new_track("a.mp3")).unwrap();
        let b = db.insert_track(&new_track("b.mp3")).unwrap();
        let c = db.insert_track(&new_track("c.mp3")).unwrap();
        db.store_features(a, &features()).unwrap();
        db.store_features(b, &features()).unwrap();
        db.set_deleted(&[b], true).unwrap();

        let candidates: Vec<i64> = db.get_candidates(false).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(candidates, vec![a]);

        let with_trash: Vec<i64> = db.get_candidates(true).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(with_trash, vec![a, b]);

        let pending: Vec<i64> = db
            .get_unanalyzed_tracks(false)
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(pending, vec![c]);
    }

    #[test]
    fn test_trash_restore_keeps_features() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_track(&new_track("a.mp3")).unwrap();
        db.store_features(a, &features()).unwrap();

        assert_eq!(db.set_deleted(&[a], true).unwrap(), 1);
        assert!(db.list_tracks(false).unwrap().is_empty());
        assert_eq!(db.list_tracks(true).unwrap().len(), 1);

        assert_eq!(db.set_deleted(&[a], false).unwrap(), 1);
        let track = db.get_track(a).unwrap().unwrap();
        assert!(!track.deleted);
        assert_eq!(track.features, Some(features()));

        assert_eq!(db.set_deleted(&[], true).unwrap(), 0);
    }

    #[test]
    fn test_list_tracks_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_track(&new_track("a.mp3")).unwrap();
        let b = db.insert_track(&new_track("b.mp3")).unwrap();
        let ids: Vec<i64> = db.list_tracks(false).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn test_purge_and_purge_trash() {
        let db = Database::open_in_memory().unwrap();
        let a = db.insert_track(&new_track("a.mp3")).unwrap();
        let b = db.insert_track(&new_track("b.mp3")).unwrap();
        let c = db.insert_track(&new_track("c.mp3")).unwrap();

        let removed = db.purge(&[a, 999]).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].storage_key, "a.mp3");

        db.set_deleted(&[b], true).unwrap();
        let removed = db.purge_trash().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, b);

        let remaining: Vec<i64> = db.list_tracks(true).unwrap().iter().map(|t| t.id).collect();
        assert_eq!(remaining, vec![c]);
    }

    #[test]
    fn test_stats() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 0);
        assert!(stats.mean_bpm.is_none());

        let a = db.insert_track(&new_track("a.mp3")).unwrap();
        let b = db.insert_track(&new_track("b.mp3")).unwrap();
        db.insert_track(&new_track("c.mp3")).unwrap();
        db.store_features(a, &Features::new(100.0, 100.0, 0.2).unwrap()).unwrap();
        db.store_features(b, &Features::new(300.0, 140.0, 0.6).unwrap()).unwrap();
        db.set_deleted(&[b], true).unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_tracks, 3);
        assert_eq!(stats.analyzed_tracks, 2);
        assert_eq!(stats.deleted_tracks, 1);
        assert!((stats.mean_bpm.unwrap() - 120.0).abs() < 1e-9);
        assert!((stats.mean_energy.unwrap() - 0.4).abs() < 1e-9);
        assert!((stats.total_duration_secs - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_inconsistent_row_is_reported() {
        let db = Database::open_in_memory().unwrap();
        // Bypass the CHECK constraint to fake a corrupted row.
        db.conn.execute_batch("PRAGMA ignore_check_constraints = ON;").unwrap();
        db.conn
            .execute(
                "INSERT INTO tracks (storage_key, original_name, bpm, analyzed)
                 VALUES ('k.mp3', 'K', 120.0, 1)",
                [],
            )
            .unwrap();

        let err = db.get_candidates(false).unwrap_err();
        assert!(matches!(err, DbError::Inconsistent { .. }));
    }
}
