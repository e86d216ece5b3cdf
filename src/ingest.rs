use crate::blob::{BlobError, BlobStore};
use crate::db::models::NewTrack;
use crate::db::Database;
use crate::SUPPORTED_EXTENSIONS;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Blob error: {0}")]
    Blob(#[from] BlobError),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportResult {
    /// Ids of the newly inserted tracks, in import order.
    pub imported: Vec<i64>,
    pub skipped: u64,
    pub errors: u64,
}

/// MIME type for a supported audio extension.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "opus" => "audio/opus",
        _ => return None,
    };
    Some(mime)
}

fn supported_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    SUPPORTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Collect supported audio files under the given files or directories.
/// Returns the files and the number of walk errors encountered.
fn collect_files(paths: &[PathBuf]) -> (Vec<PathBuf>, u64) {
    let mut files = Vec::new();
    let mut errors = 0;

    for root in paths {
        for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Cannot read {}: {}", root.display(), e);
                    errors += 1;
                    continue;
                }
            };
            if entry.file_type().is_file() && supported_extension(entry.path()).is_some() {
                files.push(entry.into_path());
            }
        }
    }

    (files, errors)
}

/// Copy audio files into the blob store and register them as unanalyzed
/// tracks. Empty files are skipped; per-file failures are logged and
/// counted without stopping the import.
pub fn import(
    db: &Database,
    blobs: &dyn BlobStore,
    paths: &[PathBuf],
) -> Result<ImportResult, IngestError> {
    let (files, walk_errors) = collect_files(paths);
    let mut result = ImportResult {
        errors: walk_errors,
        ..Default::default()
    };

    if files.is_empty() {
        log::info!("No supported audio files found");
        return Ok(result);
    }

    let pb = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}) {msg}",
    ) {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message("Importing...");

    for path in &files {
        match import_file(db, blobs, path) {
            Ok(Some(id)) => result.imported.push(id),
            Ok(None) => result.skipped += 1,
            Err(e) => {
                log::warn!("Error importing {}: {}", path.display(), e);
                result.errors += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message(format!(
        "Done: {} imported, {} skipped, {} errors",
        result.imported.len(),
        result.skipped,
        result.errors
    ));

    Ok(result)
}

/// Import a single file. `Ok(None)` means it was skipped.
fn import_file(
    db: &Database,
    blobs: &dyn BlobStore,
    path: &Path,
) -> Result<Option<i64>, IngestError> {
    let Some(ext) = supported_extension(path) else {
        return Ok(None);
    };
    if std::fs::metadata(path)?.len() == 0 {
        log::info!("Skipping empty file {}", path.display());
        return Ok(None);
    }

    let storage_key = blobs.put(path, &ext)?;
    let original_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| storage_key.clone());

    let new_track = NewTrack {
        storage_key: storage_key.clone(),
        original_name,
        mime: mime_for_extension(&ext).map(str::to_string),
    };

    match db.insert_track(&new_track) {
        Ok(id) => {
            log::debug!("Imported {} as track {}", path.display(), id);
            Ok(Some(id))
        }
        Err(e) => {
            // Don't leave an orphaned blob behind.
            if let Err(cleanup) = blobs.remove(&storage_key) {
                log::warn!("Failed to remove orphaned blob {storage_key}: {cleanup}");
            }
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsBlobStore;

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension("mp3"), Some("audio/mpeg"));
        assert_eq!(mime_for_extension("WAV"), Some("audio/wav"));
        assert_eq!(mime_for_extension("txt"), None);
        for ext in SUPPORTED_EXTENSIONS {
            assert!(mime_for_extension(ext).is_some(), "no mime for {ext}");
        }
    }

    #[test]
    fn test_import_directory() {
        let src = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("nested")).unwrap();
        std::fs::write(src.path().join("a.mp3"), b"fake mp3").unwrap();
        std::fs::write(src.path().join("nested/b.FLAC"), b"fake flac").unwrap();
        std::fs::write(src.path().join("empty.wav"), b"").unwrap();
        std::fs::write(src.path().join("notes.txt"), b"not audio").unwrap();

        let db = Database::open_in_memory().unwrap();
        let blobs = FsBlobStore::new(lib.path()).unwrap();
        let result = import(&db, &blobs, &[src.path().to_path_buf()]).unwrap();

        assert_eq!(result.imported.len(), 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors, 0);

        let tracks = db.list_tracks(false).unwrap();
        assert_eq!(tracks.len(), 2);
        for track in &tracks {
            assert!(!track.is_analyzed());
            assert!(!track.deleted);
            let stored = blobs.resolve(&track.storage_key).unwrap();
            assert!(stored.starts_with(lib.path()));
        }
        let flac = tracks.iter().find(|t| t.original_name == "b.FLAC").unwrap();
        assert_eq!(flac.mime.as_deref(), Some("audio/flac"));
        assert!(flac.storage_key.ends_with(".flac"));
    }

    #[test]
    fn test_import_single_file_and_missing_path() {
        let src = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        let file = src.path().join("song.ogg");
        std::fs::write(&file, b"fake ogg").unwrap();

        let db = Database::open_in_memory().unwrap();
        let blobs = FsBlobStore::new(lib.path()).unwrap();
        let result = import(&db, &blobs, &[file, src.path().join("missing")]).unwrap();

        assert_eq!(result.imported.len(), 1);
        assert_eq!(result.errors, 1);
        let track = db.get_track(result.imported[0]).unwrap().unwrap();
        assert_eq!(track.original_name, "song.ogg");
        assert_eq!(track.mime.as_deref(), Some("audio/ogg"));
    }

    #[test]
    fn test_import_nothing() {
        let src = tempfile::tempdir().unwrap();
        let lib = tempfile::tempdir().unwrap();
        let db = Database::open_in_memory().unwrap();
        let blobs = FsBlobStore::new(lib.path()).unwrap();
        assert_eq!(
            import(&db, &blobs, &[src.path().to_path_buf()]).unwrap(),
            ImportResult::default()
        );
    }
}
